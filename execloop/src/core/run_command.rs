//! Language-driven defaults for the artifact path and its run command.

use std::path::Path;

use crate::core::types::CommandSpec;

/// File extension used for the default artifact of `lang`.
pub fn artifact_extension(lang: &str) -> String {
    match lang.trim().to_ascii_lowercase().as_str() {
        "ts" | "typescript" => "ts".to_string(),
        "js" | "javascript" => "js".to_string(),
        "py" | "python" => "py".to_string(),
        "sh" | "shell" | "bash" => "sh".to_string(),
        "rs" | "rust" => "rs".to_string(),
        other => other.to_string(),
    }
}

/// Default artifact file name (`out.<ext>`) for `lang`.
pub fn default_artifact_name(lang: &str) -> String {
    format!("out.{}", artifact_extension(lang))
}

/// Resolve the command that runs `artifact`.
///
/// A configured non-placeholder command is returned unchanged; the placeholder
/// is replaced with the interpreter for `lang`. Other languages run the artifact
/// through `sh` so a missing execute bit comes back as exit 126, not a spawn failure.
pub fn derive_run_command(configured: &CommandSpec, lang: &str, artifact: &Path) -> CommandSpec {
    if !configured.is_placeholder() {
        return configured.clone();
    }
    let artifact = artifact.display().to_string();
    let interpreter = match lang.trim().to_ascii_lowercase().as_str() {
        "ts" | "typescript" => Some("tsx"),
        "js" | "javascript" => Some("node"),
        "py" | "python" => Some("python3"),
        "sh" | "shell" => Some("sh"),
        "bash" => Some("bash"),
        _ => None,
    };
    match interpreter {
        Some(program) => CommandSpec::Argv(program.to_string(), vec![artifact]),
        None => CommandSpec::Argv(
            "sh".to_string(),
            vec!["-c".to_string(), "exec \"$0\"".to_string(), artifact],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_maps_to_interpreter() {
        let artifact = Path::new("/ws/out.py");
        assert_eq!(
            derive_run_command(&CommandSpec::default(), "python", artifact),
            CommandSpec::argv("python3", &["/ws/out.py"])
        );
        assert_eq!(
            derive_run_command(&CommandSpec::default(), "TS", Path::new("out.ts")),
            CommandSpec::argv("tsx", &["out.ts"])
        );
    }

    #[test]
    fn unknown_language_execs_artifact_through_sh() {
        assert_eq!(
            derive_run_command(&CommandSpec::default(), "rust", Path::new("/ws/out.rs")),
            CommandSpec::argv("sh", &["-c", "exec \"$0\"", "/ws/out.rs"])
        );
    }

    #[test]
    fn explicit_command_is_kept() {
        let configured = CommandSpec::Shell("make test".to_string());
        assert_eq!(
            derive_run_command(&configured, "python", Path::new("out.py")),
            configured
        );
    }

    #[test]
    fn default_artifact_names() {
        assert_eq!(default_artifact_name("typescript"), "out.ts");
        assert_eq!(default_artifact_name("bash"), "out.sh");
        assert_eq!(default_artifact_name("go"), "out.go");
    }
}
