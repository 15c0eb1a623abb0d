use std::path::Path;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
    ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs,
    CreateSpeechRequestArgs, ImageUrlArgs, SpeechModel, Voice,
};
use async_openai::Client;
use async_trait::async_trait;
use base64::Engine;

use crate::capability::{RawSegment, ScriptRequest, SpeechSynthesizer, TextGenerator, VisionAnalyzer};
use crate::capture;
use crate::config::{Language, ScriptModel};
use crate::error::CallError;
use crate::prompts;

const DEEPSEEK_API_BASE: &str = "https://api.deepseek.com/v1";

fn client_for(model: ScriptModel) -> Client<OpenAIConfig> {
    match model {
        ScriptModel::DeepseekChat => Client::with_config(
            OpenAIConfig::new()
                .with_api_base(DEEPSEEK_API_BASE)
                .with_api_key(std::env::var("DEEPSEEK_API_KEY").unwrap_or_default()),
        ),
        ScriptModel::Gpt4oMini | ScriptModel::Gpt4o => Client::new(),
    }
}

fn call_error(err: OpenAIError) -> CallError {
    match err {
        OpenAIError::Reqwest(inner) => CallError::Transient(inner.to_string()),
        OpenAIError::ApiError(api) => {
            let kind = api.r#type.clone().unwrap_or_default();
            let message = api.message.clone();
            let lowered = message.to_lowercase();
            if kind.contains("rate_limit")
                || kind.contains("server_error")
                || lowered.contains("rate limit")
                || lowered.contains("overloaded")
            {
                CallError::Transient(message)
            } else {
                CallError::Permanent(message)
            }
        }
        other => CallError::Permanent(other.to_string()),
    }
}

/// Scene description over a chat completion with an inline data-URL image.
pub struct OpenAiVision {
    model: String,
}

impl OpenAiVision {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

impl Default for OpenAiVision {
    fn default() -> Self {
        Self::new("gpt-4o")
    }
}

#[async_trait]
impl VisionAnalyzer for OpenAiVision {
    async fn describe(&self, image: &Path) -> Result<String, CallError> {
        use base64::prelude::BASE64_STANDARD;

        let bytes = tokio::fs::read(image)
            .await
            .map_err(|err| CallError::Permanent(format!("read frame failed: {err}")))?;
        let data_url = "data:image/jpeg;base64,".to_owned() + &BASE64_STANDARD.encode(bytes);

        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.as_str())
            .max_tokens(512_u32)
            .messages([ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(ChatCompletionRequestUserMessageContent::Array(vec![
                        ChatCompletionRequestUserMessageContentPart::Text(
                            ChatCompletionRequestMessageContentPartTextArgs::default()
                                .text(
                                    "Describe what is happening in this video frame in two or \
                                     three sentences. Name the concrete objects, actions and \
                                     any readable on-screen text.",
                                )
                                .build()
                                .map_err(call_error)?,
                        ),
                        ChatCompletionRequestUserMessageContentPart::ImageUrl(
                            ChatCompletionRequestMessageContentPartImageArgs::default()
                                .image_url(
                                    ImageUrlArgs::default()
                                        .url(data_url)
                                        .build()
                                        .map_err(call_error)?,
                                )
                                .build()
                                .map_err(call_error)?,
                        ),
                    ]))
                    .build()
                    .map_err(call_error)?,
            )])
            .build()
            .map_err(call_error)?;

        let ai_client = Client::new();
        let response = ai_client.chat().create(request).await.map_err(call_error)?;
        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or(CallError::Permanent(
                "No content in response from OpenAI".into(),
            ))
    }
}

/// Timed-script generation over chat completions; the DeepSeek backend is
/// reached through its OpenAI-compatible endpoint.
pub struct OpenAiText;

#[async_trait]
impl TextGenerator for OpenAiText {
    async fn script(&self, request: &ScriptRequest) -> Result<Vec<RawSegment>, CallError> {
        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(request.config.model.model_id())
            .max_tokens(1024_u32)
            .messages([
                ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(prompts::system_prompt(request.config.style))
                        .build()
                        .map_err(call_error)?,
                ),
                ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(prompts::script_prompt(request))
                        .build()
                        .map_err(call_error)?,
                ),
            ])
            .build()
            .map_err(call_error)?;

        let ai_client = client_for(request.config.model);
        let response = ai_client
            .chat()
            .create(chat_request)
            .await
            .map_err(call_error)?;
        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or(CallError::Permanent(
                "No content in response from OpenAI".into(),
            ))?;
        parse_segments(&content)
    }
}

/// Pull the segment array out of the completion text, tolerating code fences
/// and surrounding prose. An unparseable reply is transient: another sample
/// from the model may well be clean.
fn parse_segments(content: &str) -> Result<Vec<RawSegment>, CallError> {
    let start = content.find('[');
    let end = content.rfind(']');
    let json = match (start, end) {
        (Some(start), Some(end)) if end > start => &content[start..=end],
        _ => {
            return Err(CallError::Transient(
                "script reply contained no JSON array".into(),
            ))
        }
    };
    serde_json::from_str(json)
        .map_err(|err| CallError::Transient(format!("malformed segment JSON: {err}")))
}

/// Text-to-speech via the OpenAI audio endpoint. The `rate` multiplier maps
/// to the request's speed parameter for the duration-fit pass.
pub struct OpenAiSpeech;

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(
        &self,
        text: &str,
        _language: Language,
        rate: f64,
        dest: &Path,
    ) -> Result<f64, CallError> {
        let request = CreateSpeechRequestArgs::default()
            .input(text)
            .voice(Voice::Nova)
            .model(SpeechModel::Tts1Hd)
            .speed(rate as f32)
            .build()
            .map_err(call_error)?;

        let client = Client::new();
        let response = client.audio().speech(request).await.map_err(call_error)?;
        response.save(dest).await.map_err(call_error)?;

        let clip = dest.to_path_buf();
        tokio::task::spawn_blocking(move || capture::media_duration_secs(&clip))
            .await
            .map_err(|err| CallError::Permanent(format!("duration probe aborted: {err}")))?
            .map_err(|err| CallError::Permanent(format!("duration probe failed: {err}")))
    }
}
