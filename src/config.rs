use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::FixedOffset;
use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::calendar::Calendar;

/// Server settings, read once at startup from `LABRES_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub utc_offset: FixedOffset,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables take their
    /// defaults; malformed ones are an error rather than silently ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let utc_offset = match lookup("LABRES_UTC_OFFSET") {
            Some(s) => Calendar::parse_offset(&s).ok_or_else(|| invalid("LABRES_UTC_OFFSET", &s))?,
            None => Calendar::default().offset(),
        };
        Ok(Self {
            port: parsed(&lookup, "LABRES_PORT")?.unwrap_or(5433),
            bind: lookup("LABRES_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("LABRES_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: lookup("LABRES_PASSWORD").unwrap_or_else(|| "labres".into()),
            max_connections: parsed(&lookup, "LABRES_MAX_CONNECTIONS")?.unwrap_or(256),
            metrics_port: parsed(&lookup, "LABRES_METRICS_PORT")?,
            utc_offset,
            tls_cert: lookup("LABRES_TLS_CERT"),
            tls_key: lookup("LABRES_TLS_KEY"),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Location of the snapshot document.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("labres.json")
    }

    pub fn calendar(&self) -> Calendar {
        Calendar::new(self.utc_offset)
    }

    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> io::Result<Option<T>> {
    match lookup(key) {
        Some(s) => s.trim().parse().map(Some).map_err(|_| invalid(key, &s)),
        None => Ok(None),
    }
}

fn invalid(key: &str, value: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, format!("invalid {key}: {value:?}"))
}

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both LABRES_TLS_CERT and LABRES_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
