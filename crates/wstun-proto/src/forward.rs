//! Forward specifications and their string forms

use crate::TargetAddr;
use thiserror::Error;

/// One configured forwarding rule, immutable for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardSpec {
    /// Listen locally on `listen`, tunnel each connection to the peer-side `target`
    Local { listen: String, target: TargetAddr },
    /// Ask the peer to listen on `listen`, tunnel its connections back to the
    /// local `target`
    Remote { listen: String, target: TargetAddr },
    /// Listen locally on `listen`; the target is read per-connection from the
    /// start of the accepted byte stream
    Dynamic { listen: String },
}

/// Errors parsing a `listen:host:port`-style spec string
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecParseError {
    #[error("invalid forward spec '{0}': expected listen:host:port")]
    MissingParts(String),

    #[error("invalid forward spec '{0}': empty target host")]
    EmptyHost(String),

    #[error("invalid forward spec '{0}': bad port '{1}'")]
    BadPort(String, String),

    #[error("invalid dynamic spec '{0}': empty listen address")]
    EmptyListen(String),
}

impl ForwardSpec {
    /// Parse a local forward spec, e.g. `:8080:example.com:80`
    pub fn parse_local(spec: &str) -> Result<Self, SpecParseError> {
        let (listen, target) = split_spec(spec)?;
        Ok(ForwardSpec::Local { listen, target })
    }

    /// Parse a remote forward spec, e.g. `:9000:127.0.0.1:3000` (the listen
    /// part names the peer-side listener)
    pub fn parse_remote(spec: &str) -> Result<Self, SpecParseError> {
        let (listen, target) = split_spec(spec)?;
        Ok(ForwardSpec::Remote { listen, target })
    }

    /// Parse a dynamic forward spec, e.g. `:1080`
    pub fn parse_dynamic(spec: &str) -> Result<Self, SpecParseError> {
        if spec.trim_matches(':').is_empty() {
            return Err(SpecParseError::EmptyListen(spec.to_string()));
        }
        Ok(ForwardSpec::Dynamic {
            listen: spec.to_string(),
        })
    }

    /// The listen part of the spec (peer-side for remote forwards)
    pub fn listen(&self) -> &str {
        match self {
            ForwardSpec::Local { listen, .. } => listen,
            ForwardSpec::Remote { listen, .. } => listen,
            ForwardSpec::Dynamic { listen } => listen,
        }
    }
}

// Target host and port sit at the end, so split from the right; the
// remainder (which may itself contain a colon) is the listen address.
fn split_spec(spec: &str) -> Result<(String, TargetAddr), SpecParseError> {
    let (rest, port) = spec
        .rsplit_once(':')
        .ok_or_else(|| SpecParseError::MissingParts(spec.to_string()))?;
    let (listen, host) = rest
        .rsplit_once(':')
        .ok_or_else(|| SpecParseError::MissingParts(spec.to_string()))?;

    if host.is_empty() {
        return Err(SpecParseError::EmptyHost(spec.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| SpecParseError::BadPort(spec.to_string(), port.to_string()))?;

    Ok((listen.to_string(), TargetAddr::new(host, port)))
}
