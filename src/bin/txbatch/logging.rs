//! Subscriber setup for the `txbatch` binary: logs always go to stderr, and a plain-text
//! copy goes to `--log <file>` when one is given.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

pub(crate) fn init(level: Level, log_file: Option<&Path>) -> io::Result<()> {
    let writer = match log_file {
        Some(path) => BoxMakeWriter::new(io::stderr.and(Mutex::new(File::create(path)?))),
        None => BoxMakeWriter::new(io::stderr),
    };

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_target(false)
        // Escape codes would end up in the file copy.
        .with_ansi(log_file.is_none())
        .with_max_level(level)
        .init();
    Ok(())
}
