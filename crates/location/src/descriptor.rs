//! The persisted job descriptor.
//!
//! Each side of a job stores an INI document named `.btrfs-sxbackup` directly
//! inside its container subvolume. The copies name both sides' URLs so that
//! either end can be handed to any command. Keys this version does not know
//! are carried through a rewrite untouched; a format version newer than ours
//! is refused outright.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

use endpoint::{Endpoint, EndpointError, EndpointUrl, UrlError};
use retention::{RetentionExpression, RetentionParseError};

/// Name of the descriptor file inside a container subvolume.
pub const DESCRIPTOR_FILENAME: &str = ".btrfs-sxbackup";

/// Highest descriptor format this build reads and the one it writes.
pub const FORMAT_VERSION: u32 = 2;

const SECTION: &str = "Job";

/// The descriptor is missing, malformed, or from an incompatible future.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// Reading or writing the file failed.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    /// The document structure is broken.
    #[error("descriptor line {line}: {message}")]
    Malformed {
        /// One-based line number.
        line: usize,
        /// What was wrong.
        message: String,
    },
    /// A required key is absent.
    #[error("descriptor is missing the `{key}` key")]
    MissingKey {
        /// The absent key.
        key: &'static str,
    },
    /// Written by a newer version of the tool.
    #[error("descriptor format version {found} is newer than supported version {supported}")]
    UnsupportedVersion {
        /// Version found in the file.
        found: u32,
        /// Newest version this build understands.
        supported: u32,
    },
    /// A retention expression in the descriptor does not parse.
    #[error("descriptor retention: {0}")]
    Retention(#[from] RetentionParseError),
    /// A URL in the descriptor does not parse.
    #[error("descriptor url: {0}")]
    Url(#[from] UrlError),
}

/// One side's persisted copy of the job configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobDescriptor {
    /// URL of the source subvolume; may be absent on a destination copy when
    /// the source cannot be addressed from there.
    pub source: Option<EndpointUrl>,
    /// URL of the destination container; may be absent symmetrically.
    pub destination: Option<EndpointUrl>,
    /// Container path on the source side, relative to the source subvolume
    /// or absolute.
    pub source_container: PathBuf,
    /// Container path on the destination side.
    pub destination_container: Option<PathBuf>,
    /// Retention applied to the source snapshot set.
    pub source_retention: RetentionExpression,
    /// Retention applied to the destination snapshot set.
    pub destination_retention: RetentionExpression,
    /// Whether the transfer stream is compressed in flight.
    pub compress: bool,
    /// Format version of the copy this was read from.
    pub format_version: u32,
    /// Keys we do not understand, preserved verbatim on rewrite.
    extras: Vec<(String, String)>,
}

impl JobDescriptor {
    /// A fresh descriptor at the current format version.
    #[must_use]
    pub fn new(
        source: Option<EndpointUrl>,
        destination: Option<EndpointUrl>,
        source_container: PathBuf,
        source_retention: RetentionExpression,
        destination_retention: RetentionExpression,
        compress: bool,
    ) -> Self {
        let destination_container = destination.as_ref().map(|url| url.path().to_path_buf());
        Self {
            source,
            destination,
            source_container,
            destination_container,
            source_retention,
            destination_retention,
            compress,
            format_version: FORMAT_VERSION,
            extras: Vec::new(),
        }
    }

    /// Parses a descriptor document.
    pub fn parse(text: &str) -> Result<Self, DescriptorError> {
        let mut in_section = false;
        let mut source = None;
        let mut destination = None;
        let mut source_container: Option<PathBuf> = None;
        let mut destination_container: Option<PathBuf> = None;
        let mut source_retention: Option<RetentionExpression> = None;
        let mut destination_retention: Option<RetentionExpression> = None;
        let mut compress = false;
        let mut format_version: Option<u32> = None;
        let mut extras = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            let number = index + 1;
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or_else(|| DescriptorError::Malformed {
                        line: number,
                        message: "unterminated section header".to_string(),
                    })?;
                if name != SECTION {
                    return Err(DescriptorError::Malformed {
                        line: number,
                        message: format!("unexpected section `[{name}]`"),
                    });
                }
                in_section = true;
                continue;
            }

            if !in_section {
                return Err(DescriptorError::Malformed {
                    line: number,
                    message: format!("content before the `[{SECTION}]` section"),
                });
            }

            let (key, value) = line.split_once('=').ok_or_else(|| DescriptorError::Malformed {
                line: number,
                message: "expected `key = value`".to_string(),
            })?;
            let key = key.trim();
            let value = value.trim();

            match key {
                "source" => source = Some(EndpointUrl::parse(value)?),
                "destination" => destination = Some(EndpointUrl::parse(value)?),
                "source-container" => source_container = Some(PathBuf::from(value)),
                "destination-container" => destination_container = Some(PathBuf::from(value)),
                "source-retention" => source_retention = Some(value.parse()?),
                "destination-retention" => destination_retention = Some(value.parse()?),
                "compress" => {
                    compress = parse_bool(value).ok_or_else(|| DescriptorError::Malformed {
                        line: number,
                        message: format!("`compress` must be true or false, got `{value}`"),
                    })?;
                }
                "format-version" => {
                    let found =
                        value
                            .parse::<u32>()
                            .map_err(|_| DescriptorError::Malformed {
                                line: number,
                                message: format!("`format-version` must be an integer, got `{value}`"),
                            })?;
                    if found > FORMAT_VERSION {
                        return Err(DescriptorError::UnsupportedVersion {
                            found,
                            supported: FORMAT_VERSION,
                        });
                    }
                    format_version = Some(found);
                }
                _ => extras.push((key.to_string(), value.to_string())),
            }
        }

        if !in_section {
            return Err(DescriptorError::Malformed {
                line: 1,
                message: format!("missing `[{SECTION}]` section"),
            });
        }

        Ok(Self {
            source,
            destination,
            source_container: source_container
                .unwrap_or_else(|| PathBuf::from(crate::DEFAULT_CONTAINER)),
            destination_container,
            source_retention: source_retention
                .ok_or(DescriptorError::MissingKey { key: "source-retention" })?,
            destination_retention: destination_retention
                .ok_or(DescriptorError::MissingKey { key: "destination-retention" })?,
            compress,
            format_version: format_version.unwrap_or(1),
            extras,
        })
    }

    /// Renders the descriptor document, always at the current format version.
    #[must_use]
    pub fn render(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "[{SECTION}]");
        if let Some(source) = &self.source {
            let _ = writeln!(text, "source = {source}");
        }
        if let Some(destination) = &self.destination {
            let _ = writeln!(text, "destination = {destination}");
        }
        let _ = writeln!(text, "source-container = {}", self.source_container.display());
        if let Some(container) = &self.destination_container {
            let _ = writeln!(text, "destination-container = {}", container.display());
        }
        let _ = writeln!(text, "source-retention = {}", self.source_retention);
        let _ = writeln!(text, "destination-retention = {}", self.destination_retention);
        let _ = writeln!(text, "compress = {}", self.compress);
        let _ = writeln!(text, "format-version = {FORMAT_VERSION}");
        for (key, value) in &self.extras {
            let _ = writeln!(text, "{key} = {value}");
        }
        text
    }

    /// Loads the descriptor stored at `path` on `endpoint`.
    pub fn load(endpoint: &dyn Endpoint, path: &Path) -> Result<Self, DescriptorError> {
        let bytes = endpoint.read_file(path)?;
        Self::parse(&String::from_utf8_lossy(&bytes))
    }

    /// Writes the descriptor to `path` on `endpoint`.
    pub fn store(&self, endpoint: &dyn Endpoint, path: &Path) -> Result<(), DescriptorError> {
        endpoint.write_file(path, self.render().as_bytes())?;
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}
