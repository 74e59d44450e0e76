use std::time::Duration;

use bitbox::wal::segment_path;
use bitbox::{BitboxConfig, Engine, ErrorKind, FlushPolicy, Result};
use tempfile::TempDir;

fn assert_range(engine: &Engine) -> Result<()> {
    for offset in 0..20 {
        assert_eq!(engine.get_bit("durable", offset)?, 1, "offset {}", offset);
    }
    for offset in [20, 200, 2000] {
        assert_eq!(engine.get_bit("durable", offset)?, 0, "offset {}", offset);
    }
    Ok(())
}

fn write_range(engine: &Engine) -> Result<()> {
    let offsets: Vec<u64> = (0..20).collect();
    engine.set_bits("durable", &offsets)
}

#[test]
fn test_restart_without_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let engine = Engine::open(dir.path())?;
        write_range(&engine)?;
        assert_range(&engine)?;
    }

    let engine = Engine::open(dir.path())?;
    assert_range(&engine)?;
    assert_eq!(engine.stats()?.snapshot_wal_id, 0);
    Ok(())
}

#[test]
fn test_restart_after_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let engine = Engine::open(dir.path())?;
        write_range(&engine)?;
        engine.snapshot()?;
        // Lands in the segment after the cut.
        engine.set_bit("later", 9000)?;
    }

    let engine = Engine::open(dir.path())?;
    assert_range(&engine)?;
    assert_eq!(engine.get_bit("later", 9000)?, 1);
    assert!(engine.stats()?.snapshot_wal_id > 0);
    Ok(())
}

#[test]
fn test_restart_after_shutdown() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let engine = Engine::open(dir.path())?;
        write_range(&engine)?;
        engine.shutdown()?;
    }

    let engine = Engine::open(dir.path())?;
    assert_range(&engine)?;
    // The final snapshot covers every write.
    assert_eq!(engine.stats()?.wal_records_since_snapshot, 0);
    Ok(())
}

#[test]
fn test_batched_writes_survive_after_sync() -> Result<()> {
    let dir = TempDir::new()?;
    let config = BitboxConfig::new(dir.path()).flush_policy(FlushPolicy::Batched {
        interval: Duration::from_secs(3600),
    });
    {
        let engine = Engine::open_with_config(config.clone())?;
        write_range(&engine)?;
        engine.sync()?;
    }

    let engine = Engine::open_with_config(config)?;
    assert_range(&engine)?;
    Ok(())
}

#[test]
fn test_chunk_width_can_change_between_runs() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let engine = Engine::open_with_config(BitboxConfig::new(dir.path()).chunk_bits(64))?;
        engine.set_bits("durable", &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9])?;
        engine.snapshot()?;
        engine.set_bits("durable", &[10, 11, 12, 13, 14, 15, 16, 17, 18, 19])?;
    }

    let engine = Engine::open_with_config(BitboxConfig::new(dir.path()).chunk_bits(4096))?;
    assert_range(&engine)?;
    assert_eq!(engine.stats()?.chunks, 1);
    Ok(())
}

#[test]
fn test_corrupted_wal_fails_startup() -> Result<()> {
    let dir = TempDir::new()?;
    let config = BitboxConfig::new(dir.path());
    {
        let engine = Engine::open_with_config(config.clone())?;
        engine.set_bit("a", 1)?;
        engine.set_bit("b", 2)?;
    }

    // Flip a byte inside the first record's payload.
    let path = segment_path(&config.wal_dir(), 0);
    let mut bytes = std::fs::read(&path)?;
    bytes[70] ^= 0xff;
    std::fs::write(&path, bytes)?;

    let err = Engine::open_with_config(config).err().expect("startup must fail");
    assert_eq!(err.kind(), ErrorKind::Internal);
    Ok(())
}

#[test]
fn test_torn_tail_is_discarded() -> Result<()> {
    let dir = TempDir::new()?;
    let config = BitboxConfig::new(dir.path());
    {
        let engine = Engine::open_with_config(config.clone())?;
        engine.set_bit("a", 1)?;
        engine.set_bit("b", 2)?;
    }

    // Cut the last record short, as a crash mid-append would.
    let path = segment_path(&config.wal_dir(), 0);
    let len = std::fs::metadata(&path)?.len();
    std::fs::OpenOptions::new()
        .write(true)
        .open(&path)?
        .set_len(len - 3)?;

    let engine = Engine::open_with_config(config)?;
    assert_eq!(engine.get_bit("a", 1)?, 1);
    assert_eq!(engine.get_bit("b", 2)?, 0);

    // New writes land after the truncated tail and replay cleanly.
    engine.set_bit("b", 3)?;
    drop(engine);
    let engine = Engine::open(dir.path())?;
    assert_eq!(engine.get_bit("b", 3)?, 1);
    Ok(())
}
