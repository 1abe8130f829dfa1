//! Connection Factory (C2, `SPEC_FULL.md` §4.6).
//!
//! Every worker, the cloner's cursor and the tailer own a distinct `mongodb::Client` built from
//! an `Endpoint`; connections are never shared across tasks, so a cursor on one connection can
//! never be disturbed by a mutation issued on another.

use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::Client;
use serde::Deserialize;

use crate::error::{Error, Result};

/// A `host:port` endpoint plus the credentials and read preference used to connect to it.
#[derive(Clone, Debug, Deserialize)]
pub struct Endpoint {
    /// `host:port` of a standalone, a replica set seed or a `mongos` router.
    pub address: String,
    /// Authentication database, if credentials are supplied.
    pub auth_db: Option<String>,
    /// Username, if credentials are supplied.
    pub user: Option<String>,
    /// Password, if credentials are supplied.
    pub password: Option<String>,
    /// Whether to permit reads from a secondary (`slaveOk`).
    #[serde(default)]
    pub slave_ok: bool,
}

impl Endpoint {
    /// Build an endpoint with no credentials and `slaveOk` unset.
    pub fn new(address: impl Into<String>) -> Self {
        Endpoint {
            address: address.into(),
            auth_db: None,
            user: None,
            password: None,
            slave_ok: false,
        }
    }

    /// Attach credentials to this endpoint.
    pub fn with_credentials(
        mut self,
        auth_db: Option<String>,
        user: Option<String>,
        password: Option<String>,
    ) -> Self {
        self.auth_db = auth_db;
        self.user = user;
        self.password = password;
        self
    }

    /// Allow reads from secondaries on connections built from this endpoint.
    pub fn with_slave_ok(mut self, slave_ok: bool) -> Self {
        self.slave_ok = slave_ok;
        self
    }
}

/// Produce an authenticated connection to `endpoint`.
///
/// Each call returns a fresh `Client`; the driver pools sockets internally but this crate never
/// shares one `Client` between the cloner, the tailer and a worker, so that a slow cursor on one
/// cannot stall a write on another.
pub async fn connect(endpoint: &Endpoint) -> Result<Client> {
    let server = ServerAddress::parse(&endpoint.address).map_err(|e| Error::Connect {
        endpoint: endpoint.address.clone(),
        source: e,
    })?;

    let mut options = ClientOptions::builder().hosts(vec![server]).build();

    if let Some(user) = &endpoint.user {
        let credential = Credential::builder()
            .username(user.clone())
            .password(endpoint.password.clone())
            .source(endpoint.auth_db.clone())
            .build();
        options.credential = Some(credential);
    }

    if endpoint.slave_ok {
        options.read_preference = Some(mongodb::options::ReadPreference::SecondaryPreferred {
            options: Default::default(),
        });
    }

    Client::with_options(options).map_err(|e| Error::Connect {
        endpoint: endpoint.address.clone(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_endpoint_with_credentials() {
        let endpoint = Endpoint::new("localhost:27017").with_credentials(
            Some("admin".into()),
            Some("root".into()),
            Some("hunter2".into()),
        );

        assert_eq!(endpoint.address, "localhost:27017");
        assert_eq!(endpoint.auth_db.as_deref(), Some("admin"));
        assert!(!endpoint.slave_ok);
    }
}
