use async_trait::async_trait;

use crate::{
    config::{Implementation, Variant},
    error::ResolveError,
};

#[cfg(feature = "http")]
mod upstream;

#[cfg(feature = "http")]
pub use upstream::UpstreamResolver;

/// Versions offered when the upstream manifest cannot be reached.
pub const FALLBACK_VERSIONS: [&str; 5] = ["1.20.1", "1.19.4", "1.18.2", "1.17.1", "1.16.5"];

/// Maps an (implementation, variant, version) triple to a download URL.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        implementation: Implementation,
        variant: Variant,
        version: &str,
    ) -> Result<String, ResolveError>;
}

pub(crate) fn unsupported(
    implementation: Implementation,
    variant: Variant,
    version: &str,
) -> ResolveError {
    ResolveError::UnsupportedCombination {
        implementation,
        variant,
        version: version.to_string(),
    }
}
