//! Cell fleet and orchestrator config.

use std::path::PathBuf;

use data_types::CellAddressing;

/// How cells are addressed and how the replica set running them is driven.
#[derive(Debug, Clone, clap::Parser)]
pub struct FleetConfig {
    /// Port every cell listens on.
    #[clap(long = "cell-port", env = "CELL_PORT", default_value = "7777", action)]
    pub cell_port: u16,

    /// Headless service name used to derive cell network addresses.
    #[clap(
        long = "cell-service-name",
        env = "CELL_SERVICE_NAME",
        default_value = "storage-cells-service",
        action
    )]
    pub cell_service_name: String,

    /// Replica name prefix used to derive cell network addresses.
    #[clap(
        long = "cell-name-prefix",
        env = "CELL_NAME_PREFIX",
        default_value = "storagecells-sts",
        action
    )]
    pub cell_name_prefix: String,

    /// Name of the ordered replica set running the cells.
    #[clap(
        long = "sts-name",
        env = "STSNAME",
        default_value = "storagecells-sts",
        action
    )]
    pub sts_name: String,

    /// The byte budget of every cell.
    #[clap(
        long = "cell-capacity",
        env = "CELL_CAPACITY",
        default_value = "100",
        action
    )]
    pub cell_capacity: u64,

    /// Base URL of the workload orchestrator's API.
    #[clap(
        long = "orchestrator-url",
        env = "ORCHESTRATOR_URL",
        default_value = "https://kubernetes.default.svc",
        action
    )]
    pub orchestrator_url: String,

    /// Namespace the replica set lives in.
    #[clap(
        long = "orchestrator-namespace",
        env = "ORCHESTRATOR_NAMESPACE",
        default_value = "default",
        action
    )]
    pub orchestrator_namespace: String,

    /// File holding the bearer token for the orchestrator's API, if any.
    #[clap(long = "orchestrator-token-file", env = "ORCHESTRATOR_TOKEN_FILE", action)]
    pub orchestrator_token_file: Option<PathBuf>,

    /// File holding an additional root certificate for the orchestrator's
    /// API endpoint, if any.
    #[clap(long = "orchestrator-ca-file", env = "ORCHESTRATOR_CA_FILE", action)]
    pub orchestrator_ca_file: Option<PathBuf>,
}

impl FleetConfig {
    /// The cell addressing scheme this config describes.
    pub fn addressing(&self) -> CellAddressing {
        CellAddressing {
            name_prefix: self.cell_name_prefix.clone(),
            service_name: self.cell_service_name.clone(),
            port: self.cell_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use data_types::CellId;

    use super::*;

    #[test]
    fn test_defaults_match_historical_deployment() {
        let config = FleetConfig::try_parse_from(["server"]).unwrap();
        assert_eq!(config.cell_port, 7777);
        assert_eq!(config.cell_service_name, "storage-cells-service");
        assert_eq!(config.cell_name_prefix, "storagecells-sts");
        assert_eq!(config.sts_name, "storagecells-sts");
        assert_eq!(config.cell_capacity, 100);

        assert_eq!(
            config.addressing().url(CellId::new(0)),
            "http://storagecells-sts-0.storage-cells-service:7777"
        );
    }
}
