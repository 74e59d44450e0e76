//! Request routing for a transport layer.
//!
//! A transport decodes its wire format into [`Request`]s and hands them to a
//! [`Dispatcher`]. Offsets arrive signed, as most RPC encodings carry them;
//! negatives are rejected here, before the engine sees the request.

use std::sync::Arc;

use crate::engine::{Engine, EngineStats};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SetBit { key: String, offset: i64 },
    /// Offsets may be unsorted and may repeat.
    SetBits { key: String, offsets: Vec<i64> },
    GetBit { key: String, offset: i64 },
    Sync,
    Snapshot,
    Stats,
    Shutdown,
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::SetBit { .. } => "set_bit",
            Request::SetBits { .. } => "set_bits",
            Request::GetBit { .. } => "get_bit",
            Request::Sync => "sync",
            Request::Snapshot => "snapshot",
            Request::Stats => "stats",
            Request::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Done,
    Bit(u8),
    Stats(EngineStats),
}

/// Validates requests and routes them to the engine.
#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<Engine>,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn dispatch(&self, request: Request) -> Result<Response> {
        let name = request.name();
        let result = self.route(request);

        match &result {
            Ok(_) => tracing::debug!(request = name, "Request completed"),
            Err(e @ Error::InvalidArgument(_)) => {
                tracing::debug!(request = name, error = %e, "Request rejected")
            }
            Err(e) => tracing::warn!(
                request = name,
                kind = ?e.kind(),
                error = %e,
                "Request failed"
            ),
        }
        result
    }

    fn route(&self, request: Request) -> Result<Response> {
        match request {
            Request::SetBit { key, offset } => {
                self.engine.set_bit(&key, to_offset(offset)?)?;
                Ok(Response::Done)
            }
            Request::SetBits { key, offsets } => {
                let offsets = offsets
                    .into_iter()
                    .map(to_offset)
                    .collect::<Result<Vec<u64>>>()?;
                self.engine.set_bits(&key, &offsets)?;
                Ok(Response::Done)
            }
            Request::GetBit { key, offset } => {
                let bit = self.engine.get_bit(&key, to_offset(offset)?)?;
                Ok(Response::Bit(bit))
            }
            Request::Sync => {
                self.engine.sync()?;
                Ok(Response::Done)
            }
            Request::Snapshot => {
                self.engine.snapshot()?;
                Ok(Response::Done)
            }
            Request::Stats => Ok(Response::Stats(self.engine.stats()?)),
            Request::Shutdown => {
                self.engine.shutdown()?;
                Ok(Response::Done)
            }
        }
    }

    pub fn set_bit(&self, key: &str, offset: i64) -> Result<()> {
        self.dispatch(Request::SetBit {
            key: key.to_string(),
            offset,
        })
        .map(|_| ())
    }

    pub fn set_bits(&self, key: &str, offsets: &[i64]) -> Result<()> {
        self.dispatch(Request::SetBits {
            key: key.to_string(),
            offsets: offsets.to_vec(),
        })
        .map(|_| ())
    }

    pub fn get_bit(&self, key: &str, offset: i64) -> Result<u8> {
        match self.dispatch(Request::GetBit {
            key: key.to_string(),
            offset,
        })? {
            Response::Bit(bit) => Ok(bit),
            other => Err(Error::InvalidState(format!(
                "get_bit answered with {:?}",
                other
            ))),
        }
    }
}

fn to_offset(offset: i64) -> Result<u64> {
    u64::try_from(offset)
        .map_err(|_| Error::InvalidArgument(format!("offset {} is negative", offset)))
}
