//! Back a live log up into a compressed archive and restore it elsewhere.

use reclog::{Config, Log, SyncMode};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        segment_max_count: Some(100),
        ..Config::default()
    };
    let log = Log::create(dir.path().join("source"), config)?;

    let mut writer = log.writer().sync_mode(SyncMode::Manual).open()?;
    for i in 0..250 {
        writer.write(format!("record {i}").as_bytes())?;
    }
    writer.flush()?;
    writer.sync()?;

    // The writer stays open: backups run against a live log.
    let mut archive = Vec::new();
    log.backup(&mut archive)?;
    println!("backup of {:?} is {} bytes", log.stat(), archive.len());

    for i in 250..300 {
        writer.write(format!("record {i}").as_bytes())?;
    }
    writer.close()?;

    let target = dir.path().join("restored");
    Log::restore(&target, archive.as_slice())?;
    let restored = Log::open(&target)?;
    println!("restored {:?}", restored.stat());

    let mut reader = restored.reader().open()?;
    let mut record = Vec::new();
    let mut count = 0;
    while reader.read(&mut record).is_ok() {
        count += 1;
    }
    println!("read back {count} records, last: {}", String::from_utf8_lossy(&record));
    Ok(())
}
