use std::{
    env,
    fs::OpenOptions,
    io::{self, Write},
    path::Path,
};

use anyhow::Context;

/// Writes everything to both inner writers.
pub struct Tee<A, B> {
    first: A,
    second: B,
}

impl<A: Write, B: Write> Tee<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Tee { first, second }
    }
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.first.write_all(buf)?;
        self.second.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}

/// Sets up `env_logger`. `debug` is the `-d` count; with a log file, records
/// go to stderr and are appended to the file.
pub fn init(debug: u8, log_file: Option<&Path>) -> anyhow::Result<()> {
    match debug {
        0 => {}
        1 => env::set_var("RUST_LOG", "info"),
        2 => env::set_var("RUST_LOG", "debug"),
        _ => env::set_var("RUST_LOG", "trace"),
    }
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));

    if let Some(path) = log_file {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create log directory {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(Tee::new(
            io::stderr(),
            file,
        ))));
    }

    builder.try_init().context("install logger")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tee_copies_every_write() {
        let mut tee = Tee::new(Vec::new(), Vec::new());
        write!(tee, "page {}", 3).unwrap();
        tee.write_all(b", done\n").unwrap();
        tee.flush().unwrap();

        assert_eq!(tee.first, b"page 3, done\n");
        assert_eq!(tee.second, tee.first);
    }

    #[test]
    fn log_file_receives_records() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs").join("47219.log");

        init(0, Some(&path)).unwrap();
        log::warn!("checkpoint page 7");
        log::logger().flush();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("checkpoint page 7"));
    }
}
