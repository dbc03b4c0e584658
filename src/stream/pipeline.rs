//! Pipeline command construction
//!
//! Turns a camera's source settings and an allocated port into the argv of
//! every pipeline stage plus the reader arguments handed back to the caller.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::StreamConfig;
use crate::error::StreamError;

/// Placeholder substituted with the allocated port in overrides
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Where a camera's stream comes from and how to pull it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSource {
    /// Camera host address used for the default RTSP location
    pub host: Option<String>,
    /// Raw receiver arguments replacing the default gst-launch element chain
    pub receiver_override: Option<String>,
    /// Raw reader arguments replacing the default UDP input arguments
    pub reader_override: Option<String>,
    pub audio_enabled: bool,
    /// Verbose GStreamer logging in the child environment
    pub debug: bool,
}

impl PipelineSource {
    /// Reject sources that cannot produce a pipeline before any resource is
    /// acquired.
    pub fn validate(&self) -> Result<(), StreamError> {
        match self.receiver_override.as_deref() {
            Some(raw) => {
                split_command_line(raw)?;
            }
            None => {
                if non_empty(&self.host).is_none() {
                    return Err(StreamError::ConfigInvalid(
                        "camera has no host address and no receiver override".to_string(),
                    ));
                }
            }
        }
        if let Some(raw) = self.reader_override.as_deref() {
            split_command_line(raw)?;
        }
        Ok(())
    }
}

/// One external process of the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct StageCommand {
    /// Stage name used in logs
    pub name: &'static str,
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl StageCommand {
    /// Command line as it would be typed in a shell, for logging
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Everything needed to launch a pipeline on one port
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePlan {
    pub port: u16,
    pub stages: Vec<StageCommand>,
    /// Arguments the downstream reader uses to consume the output socket
    pub reader_args: Vec<String>,
    pub has_audio: bool,
    /// How long the stages must survive before the launch counts as started
    pub settle: Duration,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Split a command line into words
///
/// Whitespace separates words; single and double quotes group them and are
/// stripped. A backslash outside single quotes escapes the next character.
pub fn split_command_line(input: &str) -> Result<Vec<String>, StreamError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some(q) => {
                if c == q {
                    quote = None;
                } else if c == '\\' {
                    match chars.next() {
                        Some(next) => current.push(next),
                        None => break,
                    }
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        in_word = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err(StreamError::ConfigInvalid(format!(
            "unterminated quote in '{}'",
            input
        )));
    }
    if in_word {
        words.push(current);
    }
    if words.is_empty() {
        return Err(StreamError::ConfigInvalid(
            "command line is empty".to_string(),
        ));
    }
    Ok(words)
}

fn substitute_port(words: Vec<String>, port: u16) -> Vec<String> {
    let port = port.to_string();
    words
        .into_iter()
        .map(|w| w.replace(PORT_PLACEHOLDER, &port))
        .collect()
}

/// Default gst-launch element chain for `host`
fn default_receiver_args(config: &StreamConfig, host: &str, port: u16, audio: bool) -> Vec<String> {
    let path = if config.rtsp_path.starts_with('/') {
        config.rtsp_path.clone()
    } else {
        format!("/{}", config.rtsp_path)
    };

    let mut pipeline = format!(
        "rtspsrc location=rtsp://{host}{path} name=arlo latency=200 protocols=udp \
         timeout=30000000 drop-on-latency=true \
         arlo. ! rtph264depay ! queue ! mux. "
    );
    if audio {
        pipeline.push_str("arlo. ! rtpopusdepay ! queue ! mux. ");
    }
    pipeline.push_str(&format!(
        "mpegtsmux name=mux ! udpsink host=127.0.0.1 port={port}"
    ));

    pipeline.split_whitespace().map(str::to_string).collect()
}

fn default_reader_args(port: u16) -> Vec<String> {
    vec![
        "-timeout".to_string(),
        "1000000".to_string(),
        "-f".to_string(),
        "mpegts".to_string(),
        "-i".to_string(),
        format!("udp://127.0.0.1:{}", port),
    ]
}

/// Build the pipeline plan for `source` on `port`
pub fn build_plan(
    config: &StreamConfig,
    source: &PipelineSource,
    port: u16,
) -> Result<PipelinePlan, StreamError> {
    source.validate()?;

    let receiver_args = match source.receiver_override.as_deref() {
        Some(raw) => substitute_port(split_command_line(raw)?, port),
        None => {
            let host = non_empty(&source.host).ok_or_else(|| {
                StreamError::ConfigInvalid("camera has no host address".to_string())
            })?;
            default_receiver_args(config, host, port, source.audio_enabled)
        }
    };

    let reader_args = match source.reader_override.as_deref() {
        Some(raw) => substitute_port(split_command_line(raw)?, port),
        None => default_reader_args(port),
    };

    let mut env = HashMap::new();
    env.insert(
        "GST_DEBUG".to_string(),
        if source.debug { "5" } else { "1" }.to_string(),
    );

    Ok(PipelinePlan {
        port,
        stages: vec![StageCommand {
            name: "receiver",
            program: config.receiver_binary.clone(),
            args: receiver_args,
            env,
        }],
        reader_args,
        has_audio: source.audio_enabled,
        settle: config.spawn_settle(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(host: &str) -> PipelineSource {
        PipelineSource {
            host: Some(host.to_string()),
            audio_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_split_command_line() {
        assert_eq!(
            split_command_line("a  b\t c").unwrap(),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            split_command_line(r#"-i "udp://x y" 'single "inner"' esc\ aped"#).unwrap(),
            vec!["-i", "udp://x y", "single \"inner\"", "esc aped"]
        );
        assert_eq!(split_command_line("''").unwrap(), vec![""]);
    }

    #[test]
    fn test_split_rejects_bad_input() {
        assert!(matches!(
            split_command_line("-i \"udp://"),
            Err(StreamError::ConfigInvalid(_))
        ));
        assert!(matches!(
            split_command_line("   "),
            Err(StreamError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_default_plan_with_audio() {
        let plan = build_plan(&StreamConfig::default(), &source("10.0.0.5"), 40123).unwrap();
        assert!(plan.has_audio);
        assert_eq!(plan.stages.len(), 1);

        let stage = &plan.stages[0];
        assert_eq!(stage.program, "gst-launch-1.0");
        assert!(stage.args.contains(&"location=rtsp://10.0.0.5/live".to_string()));
        assert!(stage.args.contains(&"rtpopusdepay".to_string()));
        assert!(stage.args.contains(&"port=40123".to_string()));
        assert_eq!(stage.env.get("GST_DEBUG").map(String::as_str), Some("1"));
        assert_eq!(plan.settle, Duration::from_millis(200));

        assert_eq!(
            plan.reader_args,
            vec!["-timeout", "1000000", "-f", "mpegts", "-i", "udp://127.0.0.1:40123"]
        );
    }

    #[test]
    fn test_audio_disabled_omits_branch() {
        let mut src = source("10.0.0.5");
        src.audio_enabled = false;
        let plan = build_plan(&StreamConfig::default(), &src, 40123).unwrap();

        assert!(!plan.has_audio);
        assert!(!plan.stages[0].args.iter().any(|a| a == "rtpopusdepay"));
        assert!(plan.stages[0].args.iter().any(|a| a == "rtph264depay"));
    }

    #[test]
    fn test_overrides_substitute_port() {
        let src = PipelineSource {
            host: None,
            receiver_override: Some("videotestsrc ! udpsink port={port}".to_string()),
            reader_override: Some("-f mpegts -i 'udp://127.0.0.1:{port}'".to_string()),
            audio_enabled: false,
            debug: true,
        };
        let plan = build_plan(&StreamConfig::default(), &src, 35000).unwrap();

        assert_eq!(
            plan.stages[0].args,
            vec!["videotestsrc", "!", "udpsink", "port=35000"]
        );
        assert_eq!(plan.reader_args, vec!["-f", "mpegts", "-i", "udp://127.0.0.1:35000"]);
        assert_eq!(plan.stages[0].env.get("GST_DEBUG").map(String::as_str), Some("5"));
    }

    #[test]
    fn test_missing_host_is_invalid() {
        let src = PipelineSource::default();
        assert!(matches!(src.validate(), Err(StreamError::ConfigInvalid(_))));
        assert!(matches!(
            build_plan(&StreamConfig::default(), &src, 35000),
            Err(StreamError::ConfigInvalid(_))
        ));

        // An override that tokenizes to nothing is rejected even with a host
        let mut src = source("cam.local");
        src.receiver_override = Some("  ".to_string());
        assert!(matches!(src.validate(), Err(StreamError::ConfigInvalid(_))));
    }

    #[test]
    fn test_malformed_reader_override_is_invalid() {
        let mut src = source("cam.local");
        src.reader_override = Some("-i 'udp://".to_string());
        assert!(matches!(src.validate(), Err(StreamError::ConfigInvalid(_))));
    }

    #[test]
    fn test_display() {
        let plan = build_plan(&StreamConfig::default(), &source("h"), 1).unwrap();
        assert!(plan.stages[0].display().starts_with("gst-launch-1.0 rtspsrc"));
    }
}
