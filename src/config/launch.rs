use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{config::ArtifactKind, instance::Instance};

/// Runtimes used to execute installed artifacts.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub java: PathBuf,
    pub php: PathBuf,
    /// Passed as both `-Xmx` and `-Xms`.
    pub memory: String,
    /// Extra JVM flags placed before `-jar`.
    pub jvm_args: Vec<String>,
    /// Replaces the per-artifact command entirely when set.
    pub command_override: Option<LaunchCommand>,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            java: PathBuf::from("java"),
            php: PathBuf::from("php"),
            memory: "1024M".to_string(),
            jvm_args: Vec::new(),
            command_override: None,
        }
    }
}

/// A fully resolved command line, run with the instance directory as cwd.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl LaunchCommand {
    pub fn for_instance(instance: &Instance, settings: &LaunchSettings) -> Self {
        if let Some(command) = &settings.command_override {
            return command.clone();
        }

        let kind = instance.artifact_kind();
        let artifact = kind.file_name().to_string();
        match kind {
            ArtifactKind::Jar => {
                let mut args = vec![
                    format!("-Xmx{}", settings.memory),
                    format!("-Xms{}", settings.memory),
                ];
                args.extend(settings.jvm_args.iter().cloned());
                args.extend(["-jar".to_string(), artifact, "nogui".to_string()]);
                Self {
                    program: settings.java.display().to_string(),
                    args,
                    env: BTreeMap::new(),
                }
            }
            ArtifactKind::Phar => Self {
                program: settings.php.display().to_string(),
                args: vec![artifact],
                env: BTreeMap::new(),
            },
            ArtifactKind::Native => Self {
                program: instance.directory.join(artifact).display().to_string(),
                args: Vec::new(),
                // Bedrock ships its shared libraries next to the binary.
                env: BTreeMap::from([("LD_LIBRARY_PATH".to_string(), ".".to_string())]),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::config::{Implementation, Variant};

    fn instance(implementation: Implementation, variant: Variant) -> Instance {
        Instance {
            id: "alpha".to_string(),
            name: "alpha".to_string(),
            implementation,
            variant,
            version: "1.20.1".to_string(),
            directory: PathBuf::from("/srv/mc/servers/alpha"),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn java_command_uses_memory_and_nogui() {
        let settings = LaunchSettings {
            jvm_args: vec!["-XX:+UseG1GC".to_string()],
            ..LaunchSettings::default()
        };
        let cmd = LaunchCommand::for_instance(
            &instance(Implementation::Java, Variant::Paper),
            &settings,
        );
        assert_eq!(cmd.program, "java");
        assert_eq!(
            cmd.args,
            vec![
                "-Xmx1024M",
                "-Xms1024M",
                "-XX:+UseG1GC",
                "-jar",
                "server.jar",
                "nogui"
            ]
        );
    }

    #[test]
    fn bedrock_runs_native_binary_from_its_directory() {
        let cmd = LaunchCommand::for_instance(
            &instance(Implementation::Bedrock, Variant::Vanilla),
            &LaunchSettings::default(),
        );
        assert_eq!(cmd.program, "/srv/mc/servers/alpha/bedrock_server");
        assert_eq!(cmd.env.get("LD_LIBRARY_PATH").map(String::as_str), Some("."));
    }

    #[test]
    fn override_wins() {
        let settings = LaunchSettings {
            command_override: Some(LaunchCommand {
                program: "sh".to_string(),
                args: vec!["start.sh".to_string()],
                env: BTreeMap::new(),
            }),
            ..LaunchSettings::default()
        };
        let cmd = LaunchCommand::for_instance(
            &instance(Implementation::Bedrock, Variant::PocketMine),
            &settings,
        );
        assert_eq!(cmd.program, "sh");
    }
}
