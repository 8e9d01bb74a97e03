//! External tool detection.
//!
//! Resolves the ffmpeg/ffprobe binaries (honoring a configured binary
//! directory) and reports their availability for the `check-tools` command.

use std::path::{Path, PathBuf};

use crate::av::command::ToolCommand;
use crate::config::Config;

/// Availability information for one external tool.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Whether the tool was found and responded to `-version`.
    pub available: bool,
    /// Resolved path, if found.
    pub path: Option<PathBuf>,
    /// First line of `-version` output, if available.
    pub version: Option<String>,
}

/// Check availability of the tools reelcast depends on.
pub async fn check_tools(config: &Config) -> Vec<ToolInfo> {
    let mut infos = Vec::new();
    for (name, configured) in [
        ("ffmpeg", config.ffmpeg_path()),
        ("ffprobe", config.ffprobe_path()),
    ] {
        infos.push(check_tool(name, &configured).await);
    }
    infos
}

async fn check_tool(name: &str, configured: &Path) -> ToolInfo {
    let resolved = which::which(configured).ok();

    let Some(path) = resolved else {
        return ToolInfo {
            name: name.to_string(),
            available: false,
            path: None,
            version: None,
        };
    };

    let version = ToolCommand::new(path.clone())
        .arg("-version")
        .execute()
        .await
        .ok()
        .and_then(|out| {
            out.stdout_utf8()
                .lines()
                .next()
                .map(|line| line.to_string())
        });

    ToolInfo {
        name: name.to_string(),
        available: version.is_some(),
        path: Some(path),
        version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_tool_reports_unavailable() {
        let info = check_tool("nope", Path::new("nonexistent_tool_xyz_12345")).await;
        assert!(!info.available);
        assert!(info.path.is_none());
    }

    #[tokio::test]
    async fn check_tools_reports_both_binaries() {
        let config = Config::default();
        let infos = check_tools(&config).await;
        let names: Vec<&str> = infos.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["ffmpeg", "ffprobe"]);
    }
}
