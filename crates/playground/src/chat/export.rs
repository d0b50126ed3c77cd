use std::path::{Path, PathBuf};
use std::str::FromStr;

use snafu::{ResultExt, Snafu};

use super::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Text,
}

impl ExportFormat {
    pub fn default_file_name(&self) -> &'static str {
        match self {
            Self::Json => "chat_history.json",
            Self::Text => "chat_history.txt",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "txt" => Ok(Self::Text),
            other => UnknownFormatSnafu {
                stage: "parse-export-format",
                format: other.to_string(),
            }
            .fail(),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExportError {
    #[snafu(display("unknown export format '{format}', expected `json` or `text`"))]
    UnknownFormat {
        stage: &'static str,
        format: String,
    },
    #[snafu(display("failed to serialize conversation on `{stage}`: {source}"))]
    SerializeConversation {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to parse conversation JSON on `{stage}`: {source}"))]
    ParseConversation {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write export file {path:?} on `{stage}`: {source}"))]
    WriteExport {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to read conversation file {path:?} on `{stage}`: {source}"))]
    ReadImport {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Pretty-printed JSON array of `{role, content}` records.
pub fn export_json(messages: &[Message]) -> Result<String, ExportError> {
    serde_json::to_string_pretty(messages).context(SerializeConversationSnafu {
        stage: "export-json",
    })
}

pub fn import_json(raw: &str) -> Result<Vec<Message>, ExportError> {
    serde_json::from_str(raw).context(ParseConversationSnafu {
        stage: "import-json",
    })
}

/// Flattened transcript: `ROLE: content`, each message followed by a blank line.
pub fn export_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|message| {
            format!(
                "{}: {}\n\n",
                message.role.as_str().to_ascii_uppercase(),
                message.content
            )
        })
        .collect()
}

pub fn render(messages: &[Message], format: ExportFormat) -> Result<String, ExportError> {
    match format {
        ExportFormat::Json => export_json(messages),
        ExportFormat::Text => Ok(export_transcript(messages)),
    }
}

pub fn write_export(
    path: &Path,
    messages: &[Message],
    format: ExportFormat,
) -> Result<(), ExportError> {
    let content = render(messages, format)?;
    std::fs::write(path, content).context(WriteExportSnafu {
        stage: "write-export-file",
        path: path.to_path_buf(),
    })?;

    tracing::info!(
        path = ?path,
        message_count = messages.len(),
        ?format,
        "exported conversation"
    );
    Ok(())
}

pub fn read_import(path: &Path) -> Result<Vec<Message>, ExportError> {
    let raw = std::fs::read_to_string(path).context(ReadImportSnafu {
        stage: "read-import-file",
        path: path.to_path_buf(),
    })?;
    import_json(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::Role;

    fn sample() -> Vec<Message> {
        vec![
            Message::user("What is \"TTFT\"?"),
            Message::assistant("Time to first token.\nMeasured in ms."),
            Message::new(Role::Assistant, ""),
        ]
    }

    #[test]
    fn json_export_parses_back_to_same_sequence() {
        let messages = sample();
        let json = export_json(&messages).unwrap();
        assert_eq!(import_json(&json).unwrap(), messages);
    }

    #[test]
    fn json_uses_lowercase_roles() {
        let json = export_json(&[Message::user("hi")]).unwrap();
        assert_eq!(
            json,
            "[\n  {\n    \"role\": \"user\",\n    \"content\": \"hi\"\n  }\n]"
        );
    }

    #[test]
    fn transcript_uppercases_roles_and_separates_with_blank_lines() {
        let text = export_transcript(&[Message::user("hi"), Message::assistant("hello")]);
        assert_eq!(text, "USER: hi\n\nASSISTANT: hello\n\n");
    }

    #[test]
    fn unknown_role_is_rejected_on_import() {
        let result = import_json(r#"[{"role": "tool", "content": "x"}]"#);
        assert!(matches!(
            result,
            Err(ExportError::ParseConversation { .. })
        ));
    }

    #[test]
    fn format_parsing_accepts_aliases() {
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("txt".parse::<ExportFormat>().unwrap(), ExportFormat::Text);
        assert!("csv".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn write_and_read_back_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ExportFormat::Json.default_file_name());

        write_export(&path, &sample(), ExportFormat::Json).unwrap();
        assert_eq!(read_import(&path).unwrap(), sample());

        let text_path = dir.path().join(ExportFormat::Text.default_file_name());
        write_export(&text_path, &sample(), ExportFormat::Text).unwrap();
        let text = std::fs::read_to_string(&text_path).unwrap();
        assert!(text.starts_with("USER: What is \"TTFT\"?\n\n"));
    }
}
