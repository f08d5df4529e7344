use anyhow::{Context, Result};
use std::net::SocketAddr;

use crate::StreamConfig;

pub fn check_stream(cfg: &StreamConfig) -> Result<()> {
    if !cfg.enable {
        return Ok(());
    }
    cfg.bind
        .parse::<SocketAddr>()
        .with_context(|| format!("stream.bind is not host:port: {}", cfg.bind))?;
    anyhow::ensure!(
        !cfg.name.is_empty() && !cfg.name.contains('/'),
        "stream.name must be a single path segment"
    );
    anyhow::ensure!((1..=100).contains(&cfg.jpeg_quality), "stream.jpeg_quality should be 1..100");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        check_stream(&StreamConfig::default()).unwrap();
    }

    #[test]
    fn bad_bind_and_name_fail() {
        let cfg = StreamConfig { bind: "localhost".into(), ..StreamConfig::default() };
        assert!(check_stream(&cfg).is_err());
        let cfg = StreamConfig { name: "a/b".into(), ..StreamConfig::default() };
        assert!(check_stream(&cfg).is_err());
    }

    #[test]
    fn disabled_stream_is_not_checked() {
        let cfg = StreamConfig { enable: false, bind: "nope".into(), ..StreamConfig::default() };
        assert!(check_stream(&cfg).is_ok());
    }
}
