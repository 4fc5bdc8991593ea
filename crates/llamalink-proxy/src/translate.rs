//! Bidirectional, stateless mapping between the OpenAI and Ollama schemas.
//!
//! Pure functions only — no I/O. Translation is deterministic given its
//! inputs: the handlers synthesize the completion id and `created` timestamp
//! once per request and pass them in.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::error::ProxyError;
use crate::models::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, CompletionChoice,
    CompletionRequest, CompletionResponse, ModelInfo, ModelsResponse, Usage,
};
use crate::ollama_models::{
    OllamaChatMessage, OllamaChatRequest, OllamaChatResponse, OllamaGenerateRequest,
    OllamaGenerateResponse, OllamaOptions, OllamaTagsResponse,
};

/// Translate an OpenAI chat completion request into Ollama's /api/chat shape.
///
/// Messages are mapped 1:1 preserving order and roles; sampling parameters
/// move into the native `options` object. Fields Ollama has no equivalent
/// for (penalties, `n`, ...) are dropped rather than rejected. The only
/// failure is an empty model name — existence is checked by the upstream.
pub fn chat_to_ollama(req: &ChatCompletionRequest) -> Result<OllamaChatRequest, ProxyError> {
    ensure_model(&req.model)?;
    Ok(OllamaChatRequest {
        model: req.model.clone(),
        messages: req
            .messages
            .iter()
            .map(|m| OllamaChatMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect(),
        stream: req.stream,
        options: sampling_options(
            req.temperature,
            req.top_p,
            req.max_tokens,
            req.stop.clone(),
            req.seed,
        ),
    })
}

/// Translate an OpenAI text completion request into Ollama's /api/generate shape.
pub fn completion_to_ollama(req: &CompletionRequest) -> Result<OllamaGenerateRequest, ProxyError> {
    ensure_model(&req.model)?;
    Ok(OllamaGenerateRequest {
        model: req.model.clone(),
        prompt: req.prompt.clone(),
        stream: req.stream,
        options: sampling_options(
            req.temperature,
            req.top_p,
            req.max_tokens,
            req.stop.clone(),
            req.seed,
        ),
    })
}

/// Wrap a buffered /api/chat response in the OpenAI chat completion envelope.
pub fn chat_from_ollama(
    resp: OllamaChatResponse,
    id: String,
    created: i64,
    model: &str,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id,
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: resp.message.content,
            },
            finish_reason: finish_reason(resp.done, resp.done_reason.as_deref()),
        }],
        usage: Some(usage_from_counts(resp.prompt_eval_count, resp.eval_count)),
    }
}

/// Wrap a buffered /api/generate response in the OpenAI text completion envelope.
pub fn completion_from_ollama(
    resp: OllamaGenerateResponse,
    id: String,
    created: i64,
    model: &str,
) -> CompletionResponse {
    CompletionResponse {
        id,
        object: "text_completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![CompletionChoice {
            index: 0,
            text: resp.response,
            finish_reason: finish_reason(resp.done, resp.done_reason.as_deref()),
        }],
        usage: Some(usage_from_counts(resp.prompt_eval_count, resp.eval_count)),
    }
}

/// Project Ollama's /api/tags payload into the OpenAI model listing.
///
/// Upstream order is preserved (not re-sorted) so the listing stays stable
/// across calls whenever the upstream order is stable.
pub fn models_from_tags(tags: OllamaTagsResponse, created: i64) -> ModelsResponse {
    ModelsResponse {
        object: "list".to_string(),
        data: tags
            .models
            .into_iter()
            .map(|tag| ModelInfo {
                id: tag.name,
                object: "model".to_string(),
                created,
                owned_by: "ollama".to_string(),
            })
            .collect(),
    }
}

/// Map Ollama's `done`/`done_reason` pair onto OpenAI's `finish_reason`.
///
/// A normal completion (no reason, or `"stop"`) maps to `"stop"` and
/// length-based truncation to `"length"`. Any other reason is omitted
/// rather than guessed.
#[must_use]
pub fn finish_reason(done: bool, done_reason: Option<&str>) -> Option<String> {
    if !done {
        return None;
    }
    match done_reason {
        None | Some("stop") => Some("stop".to_string()),
        Some("length") => Some("length".to_string()),
        Some(_) => None,
    }
}

/// Synthesize a chat completion id (`chatcmpl-<12 hex chars>`).
#[must_use]
pub fn chat_completion_id() -> String {
    format!("chatcmpl-{}", short_uuid())
}

/// Synthesize a text completion id (`cmpl-<12 hex chars>`).
#[must_use]
pub fn completion_id() -> String {
    format!("cmpl-{}", short_uuid())
}

/// Current unix timestamp in seconds, for the `created` field.
#[must_use]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

fn short_uuid() -> String {
    let mut hex = Uuid::new_v4().simple().to_string();
    hex.truncate(12);
    hex
}

fn ensure_model(model: &str) -> Result<(), ProxyError> {
    if model.trim().is_empty() {
        return Err(ProxyError::MissingModel);
    }
    Ok(())
}

fn sampling_options(
    temperature: Option<f32>,
    top_p: Option<f32>,
    max_tokens: Option<u32>,
    stop: Option<Vec<String>>,
    seed: Option<i64>,
) -> OllamaOptions {
    OllamaOptions {
        temperature,
        top_p,
        num_predict: max_tokens.map(i64::from),
        stop,
        seed,
    }
}

fn usage_from_counts(prompt_tokens: Option<u32>, completion_tokens: Option<u32>) -> Usage {
    let prompt = prompt_tokens.unwrap_or(0);
    let completion = completion_tokens.unwrap_or(0);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ollama_models::OllamaModelTag;

    fn chat_request(model: &str, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "You are terse.".to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: "Hello!".to_string(),
                },
                ChatMessage {
                    role: "assistant".to_string(),
                    content: "Hi.".to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: "Bye.".to_string(),
                },
            ],
            stream,
            temperature: Some(0.7),
            top_p: Some(0.9),
            max_tokens: Some(128),
            stop: Some(vec!["\n\n".to_string()]),
            seed: Some(42),
            presence_penalty: Some(0.5),
            frequency_penalty: None,
        }
    }

    #[test]
    fn test_chat_to_ollama_preserves_order_and_roles() {
        let req = chat_request("llama2", false);
        let native = chat_to_ollama(&req).unwrap();

        assert_eq!(native.model, "llama2");
        assert!(!native.stream);
        let roles: Vec<&str> = native.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        let contents: Vec<&str> = native.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["You are terse.", "Hello!", "Hi.", "Bye."]);
    }

    #[test]
    fn test_chat_to_ollama_maps_sampling_into_options() {
        let req = chat_request("llama2", true);
        let native = chat_to_ollama(&req).unwrap();

        assert!(native.stream);
        assert_eq!(native.options.temperature, Some(0.7));
        assert_eq!(native.options.top_p, Some(0.9));
        assert_eq!(native.options.num_predict, Some(128));
        assert_eq!(native.options.stop, Some(vec!["\n\n".to_string()]));
        assert_eq!(native.options.seed, Some(42));
        // presence_penalty has no Ollama equivalent and is dropped; the
        // serialized options must not grow unknown keys.
        let json = serde_json::to_value(&native.options).unwrap();
        assert!(json.get("presence_penalty").is_none());
    }

    #[test]
    fn test_empty_model_is_rejected() {
        let mut req = chat_request("", false);
        assert!(matches!(
            chat_to_ollama(&req),
            Err(ProxyError::MissingModel)
        ));
        req.model = "   ".to_string();
        assert!(matches!(
            chat_to_ollama(&req),
            Err(ProxyError::MissingModel)
        ));
    }

    #[test]
    fn test_round_trip_preserves_model_and_content() {
        let req = chat_request("llama2", false);
        let native = chat_to_ollama(&req).unwrap();

        // Synthesize the upstream answer and project it back.
        let upstream = OllamaChatResponse {
            model: native.model.clone(),
            message: OllamaChatMessage {
                role: "assistant".to_string(),
                content: "Hi there".to_string(),
            },
            done: true,
            done_reason: Some("stop".to_string()),
            prompt_eval_count: Some(12),
            eval_count: Some(3),
        };
        let response = chat_from_ollama(upstream, "chatcmpl-test".to_string(), 1700000000, &req.model);

        assert_eq!(response.model, "llama2");
        assert_eq!(response.object, "chat.completion");
        assert_eq!(response.choices.len(), 1);
        assert_eq!(response.choices[0].message.role, "assistant");
        assert_eq!(response.choices[0].message.content, "Hi there");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
        let usage = response.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn test_completion_translation() {
        let req = CompletionRequest {
            model: "codellama".to_string(),
            prompt: "fn main() {".to_string(),
            stream: false,
            temperature: None,
            top_p: None,
            max_tokens: Some(16),
            stop: None,
            seed: None,
        };
        let native = completion_to_ollama(&req).unwrap();
        assert_eq!(native.prompt, "fn main() {");
        assert_eq!(native.options.num_predict, Some(16));

        let upstream = OllamaGenerateResponse {
            response: " println!(\"hi\"); }".to_string(),
            done: true,
            ..Default::default()
        };
        let response = completion_from_ollama(upstream, "cmpl-test".to_string(), 1700000000, &req.model);
        assert_eq!(response.object, "text_completion");
        assert_eq!(response.choices[0].text, " println!(\"hi\"); }");
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(finish_reason(false, None), None);
        assert_eq!(finish_reason(false, Some("stop")), None);
        assert_eq!(finish_reason(true, None).as_deref(), Some("stop"));
        assert_eq!(finish_reason(true, Some("stop")).as_deref(), Some("stop"));
        assert_eq!(finish_reason(true, Some("length")).as_deref(), Some("length"));
        // Unmapped reasons are omitted, never guessed.
        assert_eq!(finish_reason(true, Some("load")), None);
        assert_eq!(finish_reason(true, Some("unload")), None);
    }

    #[test]
    fn test_models_from_tags_preserves_upstream_order() {
        let tags = OllamaTagsResponse {
            models: vec![
                OllamaModelTag {
                    name: "zephyr:latest".to_string(),
                },
                OllamaModelTag {
                    name: "llama2:7b".to_string(),
                },
                OllamaModelTag {
                    name: "mistral:latest".to_string(),
                },
            ],
        };
        let listing = models_from_tags(tags, 1700000000);

        assert_eq!(listing.object, "list");
        let ids: Vec<&str> = listing.data.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["zephyr:latest", "llama2:7b", "mistral:latest"]);
        assert!(listing.data.iter().all(|m| m.owned_by == "ollama"));
        assert!(listing.data.iter().all(|m| m.object == "model"));
    }

    #[test]
    fn test_completion_ids_have_expected_prefixes() {
        assert!(chat_completion_id().starts_with("chatcmpl-"));
        assert!(completion_id().starts_with("cmpl-"));
        assert_eq!(chat_completion_id().len(), "chatcmpl-".len() + 12);
        assert_ne!(chat_completion_id(), chat_completion_id());
    }
}
