use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

pub mod launch;
pub mod settings;

pub use launch::{LaunchCommand, LaunchSettings};
pub use settings::{BootstrapSettings, ManagerConfig};

/// Server edition. Decides which variants are installable and how the artifact is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Implementation {
    Java,
    Bedrock,
}

/// Downloadable server flavor for an [`Implementation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Vanilla,
    Paper,
    Fabric,
    Forge,
    #[serde(rename = "pocketmine")]
    PocketMine,
    Nukkit,
}

/// How an installed artifact is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Jar,
    Phar,
    Native,
}

impl Implementation {
    pub const ALL: [Implementation; 2] = [Implementation::Java, Implementation::Bedrock];

    pub fn variants(self) -> &'static [Variant] {
        match self {
            Implementation::Java => &[
                Variant::Vanilla,
                Variant::Paper,
                Variant::Fabric,
                Variant::Forge,
            ],
            Implementation::Bedrock => &[Variant::Vanilla, Variant::PocketMine, Variant::Nukkit],
        }
    }

    /// Console command that asks the server to save and shut down.
    pub fn stop_command(self) -> &'static str {
        "stop"
    }
}

impl Variant {
    pub fn supports(self, implementation: Implementation) -> bool {
        implementation.variants().contains(&self)
    }

    pub fn artifact_kind(self, implementation: Implementation) -> ArtifactKind {
        match (implementation, self) {
            (Implementation::Bedrock, Variant::Vanilla) => ArtifactKind::Native,
            (_, Variant::PocketMine) => ArtifactKind::Phar,
            _ => ArtifactKind::Jar,
        }
    }

    /// Files the server writes on its first run. Bootstrap is complete once all exist.
    pub fn generated_files(self, implementation: Implementation) -> &'static [&'static str] {
        match (implementation, self) {
            (Implementation::Java, _) => &["server.properties", "world"],
            (Implementation::Bedrock, Variant::PocketMine) => &["server.properties", "pocketmine.yml"],
            (Implementation::Bedrock, Variant::Nukkit) => &["server.properties", "nukkit.yml"],
            (Implementation::Bedrock, _) => &["server.properties", "worlds"],
        }
    }
}

impl ArtifactKind {
    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::Jar => "server.jar",
            ArtifactKind::Phar => "PocketMine-MP.phar",
            ArtifactKind::Native => "bedrock_server",
        }
    }

    /// Name the download is saved under when it ships as an archive to unpack in place.
    pub fn archive_name(self) -> Option<&'static str> {
        match self {
            ArtifactKind::Native => Some("bedrock-server.zip"),
            ArtifactKind::Jar | ArtifactKind::Phar => None,
        }
    }
}

impl Display for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Implementation::Java => write!(f, "java"),
            Implementation::Bedrock => write!(f, "bedrock"),
        }
    }
}

impl Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Variant::Vanilla => "vanilla",
            Variant::Paper => "paper",
            Variant::Fabric => "fabric",
            Variant::Forge => "forge",
            Variant::PocketMine => "pocketmine",
            Variant::Nukkit => "nukkit",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Implementation {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "java" | "java-edition" => Ok(Implementation::Java),
            "bedrock" | "bedrock-edition" => Ok(Implementation::Bedrock),
            _ => Err(ParseError::UnknownImplementation(s.to_string())),
        }
    }
}

impl FromStr for Variant {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vanilla" => Ok(Variant::Vanilla),
            "paper" => Ok(Variant::Paper),
            "fabric" => Ok(Variant::Fabric),
            "forge" => Ok(Variant::Forge),
            "pocketmine" | "pocketmine-mp" => Ok(Variant::PocketMine),
            "nukkit" => Ok(Variant::Nukkit),
            _ => Err(ParseError::UnknownVariant(s.to_string())),
        }
    }
}
