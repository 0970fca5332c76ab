//! Follow a log as it grows.
//!
//! A background writer appends a record every 200ms. The main thread reads
//! in follow mode, blocking until each record is durable, and a deadline
//! bounds every wait.

use reclog::{Config, Error, Log};
use std::thread;
use std::time::{Duration, Instant};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let log = Log::create(dir.path().join("ticks"), Config::default())?;

    let mut writer = log.writer().open()?;
    let mut reader = log.reader().follow(true).open()?;

    // Background writer: ten ticks, each flushed (and synced in the
    // background) as soon as it is written.
    let handle = thread::spawn(move || -> reclog::Result<()> {
        for i in 0..10 {
            thread::sleep(Duration::from_millis(200));
            writer.write(format!("tick {i}").as_bytes())?;
            writer.flush()?;
            println!("[writer] appended tick {i}");
        }
        writer.close()
    });

    let mut record = Vec::new();
    let mut seen = 0;
    while seen < 10 {
        reader.set_deadline(Some(Instant::now() + Duration::from_secs(5)));
        match reader.read(&mut record) {
            Ok(_) => {
                let (position, _) = reader.tell();
                println!(
                    "[reader] position {}: {}",
                    position - 1,
                    String::from_utf8_lossy(&record)
                );
                seen += 1;
            }
            Err(Error::Timeout) => println!("[reader] no new records in 5s"),
            Err(e) => return Err(e.into()),
        }
    }

    handle.join().expect("writer thread panicked")?;
    reader.close()?;
    println!("\nDone: followed {seen} records. {:?}", log.stat());
    Ok(())
}
