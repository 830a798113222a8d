//! Shared constants for the aggregation server.

use std::time::Duration;

/// Group/version of the synthetic aggregated API.
pub const GROUP_VERSION: &str = "resources.hns.demo/v1alpha1";

/// URL prefix all aggregated endpoints are served under.
pub const API_PREFIX: &str = "/apis/resources.hns.demo/v1alpha1";

/// Label key suffix HNC puts on every descendant namespace. The full key is
/// `<ancestor><HNS_LABEL_SUFFIX>`.
pub const HNS_LABEL_SUFFIX: &str = ".tree.hnc.x-k8s.io/depth";

/// Namespace holding the extension apiserver authentication ConfigMap.
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Name of the ConfigMap carrying the client CA bundle and CN allow-list.
pub const EXTENSION_CONFIG_MAP: &str = "extension-apiserver-authentication";

/// ConfigMap key with the PEM client CA bundle.
pub const CLIENT_CA_KEY: &str = "requestheader-client-ca-file";

/// ConfigMap key with the JSON array of allowed certificate common names.
pub const ALLOWED_CN_KEY: &str = "requestheader-allowed-names";

/// Maximum concurrent per-namespace list calls within one request.
pub const LIST_WORKERS: usize = 3;

/// Coalescing window between a schema change event and the discovery fetch.
pub const REFRESH_DELAY: Duration = Duration::from_millis(500);

/// Delay before retrying a failed discovery fetch.
pub const RETRY_PERIOD: Duration = Duration::from_secs(30);
