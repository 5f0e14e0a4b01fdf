//! Command-line templates with per-point placeholders.
//!
//! Supported placeholders: `{parameter}`, `{output_dir}`, `{name}` and
//! `{descriptor.KEY}`. `{{` and `}}` produce literal braces.

use serde_json::Value;
use std::mem;

use ramp_sweep::EvaluationRequest;
use ramp_types::{config_error, EvalResult, EvaluationError, ExperimentConfig, RampResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Parameter,
    OutputDir,
    Name,
    Descriptor(String),
}

/// A program and its arguments, parsed once and rendered per evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: Vec<Segment>,
    args: Vec<Vec<Segment>>,
}

impl CommandTemplate {
    pub fn parse(program: &str, args: &[String]) -> RampResult<Self> {
        if program.trim().is_empty() {
            return Err(config_error!("evaluator program must not be empty"));
        }
        let program = parse_template(program).map_err(|e| config_error!("{e}"))?;
        let args = args
            .iter()
            .map(|arg| parse_template(arg).map_err(|e| config_error!("{e}")))
            .collect::<RampResult<Vec<_>>>()?;
        Ok(Self { program, args })
    }

    /// Descriptor fields referenced by the template but absent from `config`.
    pub fn missing_fields(&self, config: &ExperimentConfig) -> Vec<String> {
        std::iter::once(&self.program)
            .chain(&self.args)
            .flatten()
            .filter_map(|segment| match segment {
                Segment::Descriptor(key) if config.descriptor_field(key).is_none() => {
                    Some(key.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Program and arguments for one evaluation.
    pub fn render(&self, request: &EvaluationRequest<'_>) -> EvalResult<(String, Vec<String>)> {
        let program = render_segments(&self.program, request)?;
        let args = self
            .args
            .iter()
            .map(|arg| render_segments(arg, request))
            .collect::<EvalResult<Vec<_>>>()?;
        Ok((program, args))
    }
}

fn parse_template(text: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => key.push(c),
                        None => return Err(format!("unterminated placeholder in '{text}'")),
                    }
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(mem::take(&mut literal)));
                }
                segments.push(placeholder(&key).ok_or_else(|| {
                    format!("unknown placeholder '{{{key}}}' in '{text}'")
                })?);
            }
            '}' => return Err(format!("unmatched '}}' in '{text}'")),
            c => literal.push(c),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn placeholder(key: &str) -> Option<Segment> {
    match key {
        "parameter" => Some(Segment::Parameter),
        "output_dir" => Some(Segment::OutputDir),
        "name" => Some(Segment::Name),
        _ => key
            .strip_prefix("descriptor.")
            .filter(|field| !field.is_empty())
            .map(|field| Segment::Descriptor(field.to_string())),
    }
}

fn render_segments(segments: &[Segment], request: &EvaluationRequest<'_>) -> EvalResult<String> {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Parameter => out.push_str(&request.point.to_string()),
            Segment::OutputDir => out.push_str(&request.output_dir.display().to_string()),
            Segment::Name => out.push_str(&request.experiment.name),
            Segment::Descriptor(key) => match request.experiment.descriptor_field(key) {
                Some(Value::String(s)) => out.push_str(s),
                Some(Value::Null) => {}
                Some(other) => out.push_str(&other.to_string()),
                None => {
                    return Err(EvaluationError::Other {
                        message: format!(
                            "experiment '{}' has no descriptor field '{key}'",
                            request.experiment.name
                        ),
                    })
                }
            },
        }
    }
    Ok(out)
}
