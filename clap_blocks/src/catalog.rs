//! Catalog connection config.

/// Where the catalog store lives.
#[derive(Debug, Clone, clap::Parser)]
pub struct CatalogConfig {
    /// Hostname of the catalog store.
    #[clap(long = "db-svr", env = "DB_SVR", default_value = "localhost", action)]
    pub db_host: String,

    /// Port of the catalog store.
    #[clap(long = "db-port", env = "DB_PORT", default_value = "27017", action)]
    pub db_port: u16,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = CatalogConfig::try_parse_from(["server"]).unwrap();
        assert_eq!(config.db_host, "localhost");
        assert_eq!(config.db_port, 27017);
    }

    #[test]
    fn test_explicit_values() {
        let config = CatalogConfig::try_parse_from([
            "server",
            "--db-svr",
            "catalog.internal",
            "--db-port",
            "27018",
        ])
        .unwrap();
        assert_eq!(config.db_host, "catalog.internal");
        assert_eq!(config.db_port, 27018);
    }
}
