use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, de::DeserializeOwned};
use tracing::{debug, warn};

use super::{FALLBACK_VERSIONS, Resolver, unsupported};
use crate::{
    config::{Implementation, Variant},
    error::ResolveError,
};

const MANIFEST_URL: &str = "https://piston-meta.mojang.com/mc/game/version_manifest_v2.json";
const PAPER_API: &str = "https://api.papermc.io/v2/projects/paper";
const FABRIC_META: &str = "https://meta.fabricmc.net/v2/versions/loader";
const FABRIC_LOADER: &str = "0.16.10";
const FABRIC_INSTALLER: &str = "1.0.1";
const FORGE_MAVEN: &str = "https://maven.minecraftforge.net/net/minecraftforge/forge";
const FORGE_BUILD: &str = "47.1.0";
const BEDROCK_URL: &str = "https://minecraft.azureedge.net/bin-linux/bedrock-server-1.20.15.01.zip";
const POCKETMINE_URL: &str =
    "https://github.com/pmmp/PocketMine-MP/releases/latest/download/PocketMine-MP.phar";
const NUKKIT_URL: &str = "https://ci.opencollab.dev/job/NukkitX/job/Nukkit/job/master/lastSuccessfulBuild/artifact/target/nukkit-1.0-SNAPSHOT.jar";

#[derive(Debug, Clone, Deserialize)]
struct VersionManifest {
    latest: Latest,
    versions: Vec<VersionRef>,
}

#[derive(Debug, Clone, Deserialize)]
struct Latest {
    release: String,
}

#[derive(Debug, Clone, Deserialize)]
struct VersionRef {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct VersionJson {
    downloads: Downloads,
}

#[derive(Debug, Clone, Deserialize)]
struct Downloads {
    server: Option<ServerDownload>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServerDownload {
    url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PaperVersion {
    builds: Vec<u32>,
}

/// Resolves download URLs against the public upstream services.
///
/// Vanilla goes through the Mojang version manifest and paper through the PaperMC builds API.
/// Everything else is a fixed URL template.
#[derive(Debug, Clone)]
pub struct UpstreamResolver {
    client: reqwest::Client,
    manifest_url: String,
    paper_api: String,
}

impl UpstreamResolver {
    pub fn new() -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mcsm/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ResolveError::Lookup {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            manifest_url: MANIFEST_URL.to_string(),
            paper_api: PAPER_API.to_string(),
        }
    }

    /// Points the resolver at mirrors.
    pub fn with_endpoints<S: Into<String>>(mut self, manifest_url: S, paper_api: S) -> Self {
        self.manifest_url = manifest_url.into();
        self.paper_api = paper_api.into();
        self
    }

    /// Release ids from the version manifest, newest first. Falls back to a fixed list.
    pub async fn versions(&self, implementation: Implementation) -> Vec<String> {
        match self.manifest().await {
            Ok(manifest) => manifest
                .versions
                .into_iter()
                .filter(|v| v.kind == "release")
                .map(|v| v.id)
                .collect(),
            Err(e) => {
                warn!(%implementation, error = %e, "version manifest unavailable, using fallback list");
                FALLBACK_VERSIONS.iter().map(|v| v.to_string()).collect()
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, ResolveError> {
        let lookup = |reason: String| ResolveError::Lookup {
            url: url.to_string(),
            reason,
        };

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| lookup(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().map_err(|e| lookup(e.to_string()))?;
        let body = resp.json::<T>().await.map_err(|e| lookup(e.to_string()))?;
        Ok(Some(body))
    }

    async fn manifest(&self) -> Result<VersionManifest, ResolveError> {
        self.get_json(&self.manifest_url)
            .await?
            .ok_or_else(|| ResolveError::Lookup {
                url: self.manifest_url.clone(),
                reason: "manifest not found".to_string(),
            })
    }

    async fn vanilla_url(&self, version: &str) -> Result<String, ResolveError> {
        let manifest = self.manifest().await?;
        let version_id = if version == "latest" {
            manifest.latest.release.clone()
        } else {
            version.to_string()
        };

        let vref = manifest
            .versions
            .into_iter()
            .find(|v| v.id == version_id)
            .ok_or_else(|| unsupported(Implementation::Java, Variant::Vanilla, version))?;

        let vjson: VersionJson = self
            .get_json(&vref.url)
            .await?
            .ok_or_else(|| unsupported(Implementation::Java, Variant::Vanilla, version))?;

        // Very old versions have no dedicated server download.
        vjson
            .downloads
            .server
            .map(|s| s.url)
            .ok_or_else(|| unsupported(Implementation::Java, Variant::Vanilla, version))
    }

    async fn paper_url(&self, version: &str) -> Result<String, ResolveError> {
        let url = format!("{}/versions/{version}", self.paper_api);
        let build = self
            .get_json::<PaperVersion>(&url)
            .await?
            .and_then(|v| v.builds.last().copied())
            .ok_or_else(|| unsupported(Implementation::Java, Variant::Paper, version))?;

        Ok(format!(
            "{}/versions/{version}/builds/{build}/downloads/paper-{version}-{build}.jar",
            self.paper_api
        ))
    }
}

/// URLs that need no lookup. `None` means the combination needs an upstream query or is invalid.
fn template_url(implementation: Implementation, variant: Variant, version: &str) -> Option<String> {
    match (implementation, variant) {
        (Implementation::Java, Variant::Fabric) => Some(format!(
            "{FABRIC_META}/{version}/{FABRIC_LOADER}/{FABRIC_INSTALLER}/server/jar"
        )),
        (Implementation::Java, Variant::Forge) => Some(format!(
            "{FORGE_MAVEN}/{version}-{FORGE_BUILD}/forge-{version}-{FORGE_BUILD}-installer.jar"
        )),
        (Implementation::Bedrock, Variant::Vanilla) => Some(BEDROCK_URL.to_string()),
        (Implementation::Bedrock, Variant::PocketMine) => Some(POCKETMINE_URL.to_string()),
        (Implementation::Bedrock, Variant::Nukkit) => Some(NUKKIT_URL.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Resolver for UpstreamResolver {
    async fn resolve(
        &self,
        implementation: Implementation,
        variant: Variant,
        version: &str,
    ) -> Result<String, ResolveError> {
        let version = version.trim();
        if version.is_empty() || !variant.supports(implementation) {
            return Err(unsupported(implementation, variant, version));
        }

        let url = match (implementation, variant) {
            (Implementation::Java, Variant::Vanilla) => self.vanilla_url(version).await?,
            (Implementation::Java, Variant::Paper) => self.paper_url(version).await?,
            _ => template_url(implementation, variant, version)
                .ok_or_else(|| unsupported(implementation, variant, version))?,
        };

        debug!(%implementation, %variant, version, url = %url, "resolved download");
        Ok(url)
    }
}
