pub mod collector;
pub mod command;
pub mod config;
pub mod counter;
pub mod error;
pub mod orchestrator;
pub mod payload;
pub mod plugin;
pub mod postback;

/// Common types used across modules
pub mod types {
    use serde_json::{Map, Value};

    /// Ordered set of payload keys produced by one collector in one cycle
    pub type MetricSet = Map<String, Value>;

    /// What a collector hands back for one cycle.
    ///
    /// `NoData` means "nothing to report": the collector's keys are simply
    /// absent from the payload. It is not an error and not a zero.
    #[derive(Debug, Clone, PartialEq)]
    pub enum CollectorResult {
        Data(MetricSet),
        NoData,
    }

    impl CollectorResult {
        /// Wrap a metric set, collapsing an empty one into `NoData`
        pub fn from_set(set: MetricSet) -> Self {
            if set.is_empty() {
                CollectorResult::NoData
            } else {
                CollectorResult::Data(set)
            }
        }

        pub fn is_data(&self) -> bool {
            matches!(self, CollectorResult::Data(_))
        }

        pub fn into_set(self) -> Option<MetricSet> {
            match self {
                CollectorResult::Data(set) => Some(set),
                CollectorResult::NoData => None,
            }
        }
    }

    impl From<Option<MetricSet>> for CollectorResult {
        fn from(value: Option<MetricSet>) -> Self {
            value.map(Self::from_set).unwrap_or(CollectorResult::NoData)
        }
    }

    /// Operating system family the agent is running on
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Platform {
        Linux,
        FreeBsd,
        MacOs,
        Other,
    }

    impl Platform {
        /// Platform of the running binary
        pub fn current() -> Self {
            Self::from_os(std::env::consts::OS)
        }

        pub fn from_os(os: &str) -> Self {
            match os {
                "linux" => Platform::Linux,
                "freebsd" => Platform::FreeBsd,
                "macos" => Platform::MacOs,
                _ => Platform::Other,
            }
        }

        /// Value reported in the payload's `os` field
        pub fn payload_name(&self) -> &'static str {
            match self {
                Platform::Linux => "linux",
                Platform::FreeBsd => "freebsd",
                Platform::MacOs => "mac",
                Platform::Other => "unknown",
            }
        }

        pub fn is_bsd_like(&self) -> bool {
            matches!(self, Platform::FreeBsd | Platform::MacOs)
        }
    }

    impl std::fmt::Display for Platform {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.payload_name())
        }
    }
}
