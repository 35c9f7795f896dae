//! Text tokenization for vision-language prompts.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tokenizers::Tokenizer as HfTokenizer;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct SpecialTokens {
    pub bos: Option<String>,
    pub eos: Option<String>,
    pub bos_id: Option<u32>,
    pub eos_id: Option<u32>,
    pub pad_id: Option<u32>,
}

pub struct Tokenizer {
    inner: HfTokenizer,
    special_tokens: SpecialTokens,
}

impl Tokenizer {
    /// Load `tokenizer.json`, with special tokens from `tokenizer_config.json`
    /// when present.
    pub fn from_path(model_dir: &Path) -> Result<Self> {
        let tokenizer_path = model_dir.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(Error::TokenizationError(format!(
                "No tokenizer.json found in {:?}",
                model_dir
            )));
        }

        let inner = HfTokenizer::from_file(&tokenizer_path)
            .map_err(|e| Error::TokenizationError(e.to_string()))?;
        debug!("Loaded tokenizer from {:?}", tokenizer_path);

        let config = load_tokenizer_config(model_dir)?.unwrap_or_default();
        let bos = config.bos_token.map(TokenSpec::into_content);
        let eos = config.eos_token.map(TokenSpec::into_content);
        let pad = config.pad_token.map(TokenSpec::into_content);
        let special_tokens = SpecialTokens {
            bos_id: bos.as_deref().and_then(|t| inner.token_to_id(t)),
            eos_id: eos.as_deref().and_then(|t| inner.token_to_id(t)),
            pad_id: pad.as_deref().and_then(|t| inner.token_to_id(t)),
            bos,
            eos,
        };

        Ok(Self {
            inner,
            special_tokens,
        })
    }

    /// Encode a rendered prompt. Special tokens come from the chat template,
    /// so none are added here.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::TokenizationError(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| Error::TokenizationError(e.to_string()))
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special_tokens
    }
}

/// Special tokens are either plain strings or `{"content": ...}` entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TokenSpec {
    Text(String),
    Entry { content: String },
}

impl TokenSpec {
    pub fn into_content(self) -> String {
        match self {
            Self::Text(content) | Self::Entry { content } => content,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedTemplate {
    pub name: String,
    pub template: String,
}

/// `chat_template` is a single string or a list of named templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TemplateSource {
    Single(String),
    Named(Vec<NamedTemplate>),
}

impl TemplateSource {
    /// The `default` template, or the first one listed.
    pub fn into_default(self) -> Option<String> {
        match self {
            Self::Single(template) => Some(template),
            Self::Named(templates) => {
                let position = templates
                    .iter()
                    .position(|t| t.name == "default")
                    .unwrap_or(0);
                templates.into_iter().nth(position).map(|t| t.template)
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenizerConfigFile {
    #[serde(default)]
    pub bos_token: Option<TokenSpec>,
    #[serde(default)]
    pub eos_token: Option<TokenSpec>,
    #[serde(default)]
    pub pad_token: Option<TokenSpec>,
    #[serde(default)]
    pub chat_template: Option<TemplateSource>,
}

pub fn load_tokenizer_config(model_dir: &Path) -> Result<Option<TokenizerConfigFile>> {
    let config_path = model_dir.join("tokenizer_config.json");
    if !config_path.exists() {
        return Ok(None);
    }
    let config_str = fs::read_to_string(config_path)?;
    let config: TokenizerConfigFile = serde_json::from_str(&config_str)?;
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::shared::fixtures;

    #[test]
    fn encodes_added_tokens_and_words() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write_tokenizer(dir.path(), &["hello", "world"]);
        fixtures::write_tokenizer_config(dir.path(), "{{ bos_token }}");

        let tokenizer = Tokenizer::from_path(dir.path()).unwrap();
        let bos = tokenizer.special_tokens().bos.clone().unwrap();
        let ids = tokenizer.encode(&format!("{bos}hello world")).unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(Some(ids[0]), tokenizer.special_tokens().bos_id);
        assert_eq!(ids[1], tokenizer.token_id("hello").unwrap());
    }

    #[test]
    fn missing_tokenizer_json_is_tokenization_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Tokenizer::from_path(dir.path()).err().unwrap();
        assert!(matches!(err, Error::TokenizationError(_)));
    }

    #[test]
    fn token_specs_accept_strings_and_entries() {
        let config: TokenizerConfigFile = serde_json::from_str(
            r#"{"bos_token": {"content": "<s>", "lstrip": false}, "eos_token": "</s>"}"#,
        )
        .unwrap();
        assert_eq!(config.bos_token.unwrap().into_content(), "<s>");
        assert_eq!(config.eos_token.unwrap().into_content(), "</s>");
    }

    #[test]
    fn named_templates_prefer_default() {
        let source: TemplateSource = serde_json::from_str(
            r#"[{"name": "tool_use", "template": "a"}, {"name": "default", "template": "b"}]"#,
        )
        .unwrap();
        assert_eq!(source.into_default().as_deref(), Some("b"));
    }
}
