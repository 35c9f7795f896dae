//! Checkpoint chat templates rendered with minijinja.
//!
//! The template comes from `chat_template.json` when the checkpoint ships one
//! (processor-level templates of vision-language models), otherwise from the
//! `chat_template` entry of `tokenizer_config.json`.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use chrono::Local;
use minijinja::value::Value;
use minijinja::{context, Environment, ErrorKind, State};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::shared::chat::ChatMessage;
use crate::tokenizer::{load_tokenizer_config, TemplateSource};

const MAX_RECURSION_DEPTH: usize = 64;
const TEMPLATE_NAME: &str = "chat";

#[derive(Debug, Deserialize)]
struct ProcessorTemplateFile {
    chat_template: TemplateSource,
}

pub struct ChatTemplate {
    env: Environment<'static>,
    bos_token: String,
    eos_token: String,
}

impl std::fmt::Debug for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTemplate")
            .field("bos_token", &self.bos_token)
            .field("eos_token", &self.eos_token)
            .finish_non_exhaustive()
    }
}

impl ChatTemplate {
    pub fn new(source: String, bos_token: String, eos_token: String) -> Result<Self> {
        let mut env = Environment::new();
        env.set_recursion_limit(MAX_RECURSION_DEPTH);
        env.add_function("raise_exception", raise_exception);
        env.add_function("strftime_now", strftime_now);
        env.set_unknown_method_callback(string_methods);
        env.add_template_owned(TEMPLATE_NAME, source)
            .map_err(|e| Error::TemplateError(format!("Invalid template syntax: {e}")))?;

        Ok(Self {
            env,
            bos_token,
            eos_token,
        })
    }

    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let tokenizer_config = load_tokenizer_config(model_dir)?.unwrap_or_default();

        let processor_path = model_dir.join("chat_template.json");
        let source = if processor_path.exists() {
            let file: ProcessorTemplateFile =
                serde_json::from_str(&fs::read_to_string(&processor_path)?)?;
            debug!("Using chat template from {:?}", processor_path);
            file.chat_template.into_default()
        } else {
            tokenizer_config
                .chat_template
                .and_then(TemplateSource::into_default)
        };
        let source = source.ok_or_else(|| {
            Error::TemplateError(format!("No chat template found in {:?}", model_dir))
        })?;

        let bos = tokenizer_config
            .bos_token
            .map(|t| t.into_content())
            .unwrap_or_default();
        let eos = tokenizer_config
            .eos_token
            .map(|t| t.into_content())
            .unwrap_or_default();

        Self::new(source, bos, eos)
    }

    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<String> {
        let template = self
            .env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| Error::TemplateError(e.to_string()))?;
        template
            .render(context!(
                messages => messages,
                add_generation_prompt => add_generation_prompt,
                bos_token => self.bos_token.as_str(),
                eos_token => self.eos_token.as_str()
            ))
            .map_err(|e| Error::TemplateError(format!("Render error: {e}")))
    }
}

fn raise_exception(message: String) -> std::result::Result<String, minijinja::Error> {
    Err(minijinja::Error::new(ErrorKind::InvalidOperation, message))
}

fn strftime_now(format: String) -> std::result::Result<String, minijinja::Error> {
    let mut out = String::new();
    write!(out, "{}", Local::now().format(&format)).map_err(|_| {
        minijinja::Error::new(
            ErrorKind::InvalidOperation,
            format!("Invalid strftime format '{format}'"),
        )
    })?;
    Ok(out)
}

/// Python string methods templates commonly call (`role.upper()`).
fn string_methods(
    _state: &State,
    value: &Value,
    method: &str,
    args: &[Value],
) -> std::result::Result<Value, minijinja::Error> {
    let Some(text) = value.as_str() else {
        return Err(minijinja::Error::from(ErrorKind::UnknownMethod));
    };
    let arg = || {
        args.first().and_then(Value::as_str).ok_or_else(|| {
            minijinja::Error::new(
                ErrorKind::MissingArgument,
                format!("{method}() expects a string argument"),
            )
        })
    };
    let result = match method {
        "upper" => Value::from(text.to_uppercase()),
        "lower" => Value::from(text.to_lowercase()),
        "strip" => Value::from(text.trim()),
        "lstrip" => Value::from(text.trim_start()),
        "rstrip" => Value::from(text.trim_end()),
        "startswith" => Value::from(text.starts_with(arg()?)),
        "endswith" => Value::from(text.ends_with(arg()?)),
        _ => return Err(minijinja::Error::from(ErrorKind::UnknownMethod)),
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::shared::fixtures;

    const PLAIN: &str = "{{ bos_token }}{% for message in messages %}\
        {{ message['role'].upper() }}:\
        {% for part in message['content'] %}\
        {% if part['type'] == 'image' %}<image>{% else %} {{ part['text'] }}{% endif %}\
        {% endfor %}{% endfor %}\
        {% if add_generation_prompt %} ASSISTANT:{% endif %}";

    #[test]
    fn renders_image_question_without_generation_prompt() {
        let template = ChatTemplate::new(PLAIN.to_string(), "<s>".into(), "</s>".into()).unwrap();
        let rendered = template
            .render(&[ChatMessage::image_question("What is this?")], false)
            .unwrap();
        assert_eq!(rendered, "<s>USER:<image> What is this?");
    }

    #[test]
    fn raise_exception_becomes_template_error() {
        let template = ChatTemplate::new(
            "{{ raise_exception('only user turns') }}".to_string(),
            String::new(),
            String::new(),
        )
        .unwrap();
        let err = template.render(&[], false).unwrap_err();
        assert!(matches!(err, Error::TemplateError(_)));
        assert!(err.to_string().contains("only user turns"));
    }

    #[test]
    fn invalid_syntax_is_rejected_up_front() {
        let err = ChatTemplate::new("{% for %}".to_string(), String::new(), String::new()).unwrap_err();
        assert!(matches!(err, Error::TemplateError(_)));
    }

    #[test]
    fn processor_template_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write_tokenizer_config(dir.path(), "tokenizer");
        fs::write(
            dir.path().join("chat_template.json"),
            r#"{"chat_template": "processor {{ bos_token }}"}"#,
        )
        .unwrap();
        let template = ChatTemplate::from_model_dir(dir.path()).unwrap();
        let rendered = template.render(&[], false).unwrap();
        assert_eq!(rendered, format!("processor {}", fixtures::BOS_TOKEN));
    }

    #[test]
    fn missing_template_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChatTemplate::from_model_dir(dir.path()).unwrap_err();
        assert!(matches!(err, Error::TemplateError(_)));
    }
}
