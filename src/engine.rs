//! External conversion engine.
//!
//! Conversion runs in two separate executables: a decoder that turns a
//! proprietary recording into an XML intermediate, and an encoder that writes
//! HDF5 from the intermediate while shifting every timestamp by the file's
//! offset. Both are opaque to the pipeline and are reached through the
//! [`ConversionEngine`] trait so tests can substitute an in-process engine.
//!
//! Timeouts are enforced by the caller. [`ExternalEngine`] spawns children
//! with `kill_on_drop`, so dropping a stage future kills its process.

use async_trait::async_trait;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::{EngineConfig, SystemKind};

/// Target format selector passed to the encoder.
pub const OUTPUT_FORMAT: &str = "hdf5";

/// Encoder file name pattern: directory, input basename, separator, date, type.
pub const OUTPUT_PATTERN: &str = "%d%i-_-%s.%t";

/// Separator between the source basename and the date in staged names.
pub const STAGED_SEPARATOR: &str = "-_-";

const OUTPUT_TAIL_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    Encode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Decode => write!(f, "decode"),
            Stage::Encode => write!(f, "encode"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to launch {stage} stage ({program}): {source}")]
    Launch {
        stage: Stage,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stage} stage exited with {status}: {output}")]
    Exit {
        stage: Stage,
        status: String,
        output: String,
    },
}

/// Decoder invocation for one source file.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub source: PathBuf,
    pub output: PathBuf,
    pub system: SystemKind,
    pub wave_data: bool,
}

/// Encoder invocation for one decoded intermediate.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub offset_seconds: i64,
    pub single_output_file: bool,
}

/// Decoder arguments: `<source> -o <output> -blnk -<system> [-xw]`.
pub fn decode_args(req: &DecodeRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        req.source.clone().into(),
        "-o".into(),
        req.output.clone().into(),
        "-blnk".into(),
        req.system.flag().into(),
    ];
    if !req.wave_data {
        args.push("-xw".into());
    }
    args
}

/// Encoder arguments:
/// `-t hdf5 -C -p %d%i-_-%s.%t --offset <-offset> [-n] <input>`.
pub fn encode_args(req: &EncodeRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-t".into(),
        OUTPUT_FORMAT.into(),
        "-C".into(),
        "-p".into(),
        OUTPUT_PATTERN.into(),
        "--offset".into(),
        req.offset_seconds.saturating_neg().to_string().into(),
    ];
    if req.single_output_file {
        args.push("-n".into());
    }
    args.push(req.input.clone().into());
    args
}

#[async_trait]
pub trait ConversionEngine: Send + Sync {
    /// Run the decode stage to completion.
    async fn decode(&self, req: &DecodeRequest) -> Result<(), EngineError>;

    /// Run the re-encode stage to completion.
    async fn encode(&self, req: &EncodeRequest) -> Result<(), EngineError>;
}

/// The real engine: two executables run as child processes.
pub struct ExternalEngine {
    decoder: PathBuf,
    encoder: PathBuf,
}

impl ExternalEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            decoder: config.decoder.clone(),
            encoder: config.encoder.clone(),
        }
    }
}

#[async_trait]
impl ConversionEngine for ExternalEngine {
    async fn decode(&self, req: &DecodeRequest) -> Result<(), EngineError> {
        run_stage(Stage::Decode, &self.decoder, decode_args(req)).await
    }

    async fn encode(&self, req: &EncodeRequest) -> Result<(), EngineError> {
        run_stage(Stage::Encode, &self.encoder, encode_args(req)).await
    }
}

/// Run one stage, capturing its output for diagnostics.
async fn run_stage(stage: Stage, program: &Path, args: Vec<OsString>) -> Result<(), EngineError> {
    let mut cmd = Command::new(program);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(%stage, program = %program.display(), ?args, "starting engine stage");
    let output = cmd.output().await.map_err(|e| EngineError::Launch {
        stage,
        program: program.display().to_string(),
        source: e,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        let text = if stderr.trim().is_empty() { &stdout } else { &stderr };
        return Err(EngineError::Exit {
            stage,
            status: output.status.to_string(),
            output: tail(text.trim(), OUTPUT_TAIL_CHARS),
        });
    }

    debug!(%stage, stdout = %stdout.trim(), stderr = %stderr.trim(), "engine stage finished");
    Ok(())
}

/// Last `max` characters of `text`.
fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let skipped: String = text.chars().skip(count - max).collect();
    format!("...{}", skipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_decode_args_without_wave_data() {
        let req = DecodeRequest {
            source: PathBuf::from("/scratch/BED1-1000.stp"),
            output: PathBuf::from("/scratch/BED1-1000.xml"),
            system: SystemKind::Carescape,
            wave_data: false,
        };
        assert_eq!(
            strings(decode_args(&req)),
            vec![
                "/scratch/BED1-1000.stp",
                "-o",
                "/scratch/BED1-1000.xml",
                "-blnk",
                "-cs",
                "-xw"
            ]
        );
    }

    #[test]
    fn test_decode_args_with_wave_data() {
        let req = DecodeRequest {
            source: PathBuf::from("a.stp"),
            output: PathBuf::from("a.xml"),
            system: SystemKind::Unity,
            wave_data: true,
        };
        let args = strings(decode_args(&req));
        assert!(!args.contains(&"-xw".to_string()));
        assert!(args.contains(&"-u".to_string()));
    }

    #[test]
    fn test_encode_args_negative_offset() {
        let req = EncodeRequest {
            input: PathBuf::from("/scratch/BED1-1000.xml"),
            offset_seconds: 100,
            single_output_file: false,
        };
        assert_eq!(
            strings(encode_args(&req)),
            vec![
                "-t",
                "hdf5",
                "-C",
                "-p",
                "%d%i-_-%s.%t",
                "--offset",
                "-100",
                "/scratch/BED1-1000.xml"
            ]
        );
    }

    #[test]
    fn test_encode_args_single_file_flag_before_input() {
        let req = EncodeRequest {
            input: PathBuf::from("x.xml"),
            offset_seconds: -5,
            single_output_file: true,
        };
        let args = strings(encode_args(&req));
        assert_eq!(&args[args.len() - 2..], &["-n", "x.xml"]);
        assert_eq!(args[6], "5");
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "...def");
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_error() {
        let engine = ExternalEngine {
            decoder: PathBuf::from("/definitely/not/a/decoder"),
            encoder: PathBuf::from("/definitely/not/an/encoder"),
        };
        let req = DecodeRequest {
            source: PathBuf::from("/tmp/a.stp"),
            output: PathBuf::from("/tmp/a.xml"),
            system: SystemKind::Carescape,
            wave_data: false,
        };
        let err = engine.decode(&req).await.unwrap_err();
        assert!(matches!(err, EngineError::Launch { stage: Stage::Decode, .. }));
    }
}
