use crate::{model::Utterance, model::Speaker, tools::ToolSpec};
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionToolArgs, ChatCompletionToolType, CreateChatCompletionRequestArgs,
        FunctionCall, FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// A function call requested by the response generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// One entry of the context handed to the response generator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ContextEntry {
    /// Summary of the subject's previous session.
    PriorSummary(String),
    Utterance(Utterance),
    ToolCall(ToolRequest),
    ToolResult {
        call_id: String,
        name: String,
        content: Value,
    },
}

/// The two possible outcomes of a generation step.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentReply {
    /// Text to speak to the user.
    Answer(String),
    /// A structured function-call request.
    ToolCall(ToolRequest),
}

/// The response-generation capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Decides the next step given the conversation so far. An empty `tools`
    /// slice asks for a direct answer.
    async fn respond(&self, context: &[ContextEntry], tools: &[ToolSpec]) -> Result<AgentReply>;

    /// Condenses a finished conversation into a short summary.
    async fn summarize(&self, transcript: &[Utterance]) -> Result<String>;
}

/// Renders a transcript as `user:`/`agent:` lines.
pub fn render_transcript(transcript: &[Utterance]) -> String {
    transcript
        .iter()
        .map(|u| match u.speaker {
            Speaker::User => format!("user: {}", u.text),
            Speaker::Agent => format!("agent: {}", u.text),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// An implementation of `ResponseGenerator` for any OpenAI-compatible API.
pub struct OpenAIResponseGenerator {
    client: Client<OpenAIConfig>,
    model: String,
    prompts: HashMap<String, String>,
}

impl OpenAIResponseGenerator {
    /// Creates a new generator for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model identifier to use for chat completions (e.g., "gpt-4o").
    /// * `prompts` - Prompt templates; must contain `"system_prompt"` and
    ///   `"summarize_interaction"`.
    pub fn new(config: OpenAIConfig, model: String, prompts: HashMap<String, String>) -> Result<Self> {
        for key in ["system_prompt", "summarize_interaction"] {
            prompts
                .get(key)
                .with_context(|| format!("Missing prompt template: '{key}'"))?;
        }
        Ok(Self {
            client: Client::with_config(config),
            model,
            prompts,
        })
    }

    fn prompt(&self, key: &str) -> &str {
        self.prompts.get(key).map(String::as_str).unwrap_or_default()
    }

    fn build_messages(&self, context: &[ContextEntry]) -> Result<Vec<ChatCompletionRequestMessage>> {
        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(self.prompt("system_prompt"))
                .build()?
                .into(),
        ];

        for entry in context {
            let message: ChatCompletionRequestMessage = match entry {
                ContextEntry::PriorSummary(summary) => ChatCompletionRequestSystemMessageArgs::default()
                    .content(format!("Summary of this user's previous conversation:\n{summary}"))
                    .build()?
                    .into(),
                ContextEntry::Utterance(u) => match u.speaker {
                    Speaker::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(u.text.clone())
                        .build()?
                        .into(),
                    Speaker::Agent => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(u.text.clone())
                        .build()?
                        .into(),
                },
                ContextEntry::ToolCall(request) => ChatCompletionRequestAssistantMessageArgs::default()
                    .tool_calls(vec![ChatCompletionMessageToolCall {
                        id: request.call_id.clone(),
                        r#type: ChatCompletionToolType::Function,
                        function: FunctionCall {
                            name: request.name.clone(),
                            arguments: request.arguments.to_string(),
                        },
                    }])
                    .build()?
                    .into(),
                ContextEntry::ToolResult { call_id, content, .. } => {
                    ChatCompletionRequestToolMessageArgs::default()
                        .tool_call_id(call_id.clone())
                        .content(content.to_string())
                        .build()?
                        .into()
                }
            };
            messages.push(message);
        }
        Ok(messages)
    }
}

#[async_trait]
impl ResponseGenerator for OpenAIResponseGenerator {
    async fn respond(&self, context: &[ContextEntry], tools: &[ToolSpec]) -> Result<AgentReply> {
        let messages = self.build_messages(context)?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages(messages);
        if !tools.is_empty() {
            let tools = tools
                .iter()
                .map(|t| {
                    Ok(ChatCompletionToolArgs::default()
                        .function(
                            FunctionObjectArgs::default()
                                .name(t.name.clone())
                                .description(t.description.clone())
                                .parameters(t.parameters.clone())
                                .build()?,
                        )
                        .build()?)
                })
                .collect::<Result<Vec<_>>>()?;
            builder.tools(tools).tool_choice("auto");
        }
        let request = builder.build()?;

        let response = self.client.chat().create(request).await?;
        let message = &response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message;

        if let Some(tool_calls) = message.tool_calls.as_ref().filter(|c| !c.is_empty()) {
            if tool_calls.len() > 1 {
                warn!(
                    requested = tool_calls.len(),
                    "LLM requested several tool calls; only the first is executed"
                );
            }
            let call = &tool_calls[0];
            let arguments = if call.function.arguments.trim().is_empty() {
                Value::Null
            } else {
                // Malformed JSON is passed through as a string so that
                // validation rejects it as an argument error.
                serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| Value::String(call.function.arguments.clone()))
            };
            Ok(AgentReply::ToolCall(ToolRequest {
                call_id: call.id.clone(),
                name: call.function.name.clone(),
                arguments,
            }))
        } else if let Some(content) = &message.content {
            Ok(AgentReply::Answer(content.clone()))
        } else {
            Err(anyhow::anyhow!(
                "LLM response had neither text content nor tool calls."
            ))
        }
    }

    async fn summarize(&self, transcript: &[Utterance]) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(self.prompt("summarize_interaction"))
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(render_transcript(transcript))
                    .build()?
                    .into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;
        let summary = response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message
            .content
            .as_ref()
            .context("No content in LLM response")?;
        Ok(summary.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_openai::config::OpenAIConfig;
    use serde_json::json;

    fn prompts() -> HashMap<String, String> {
        HashMap::from([
            ("system_prompt".to_string(), "You are a support agent.".to_string()),
            ("summarize_interaction".to_string(), "Summarize.".to_string()),
        ])
    }

    #[test]
    fn generator_requires_both_prompts() {
        let mut incomplete = prompts();
        incomplete.remove("summarize_interaction");
        assert!(
            OpenAIResponseGenerator::new(OpenAIConfig::new(), "gpt-4o".to_string(), incomplete)
                .is_err()
        );
        assert!(
            OpenAIResponseGenerator::new(OpenAIConfig::new(), "gpt-4o".to_string(), prompts())
                .is_ok()
        );
    }

    #[test]
    fn context_maps_to_chat_messages_in_order() {
        let generator =
            OpenAIResponseGenerator::new(OpenAIConfig::new(), "gpt-4o".to_string(), prompts())
                .unwrap();
        let context = vec![
            ContextEntry::PriorSummary("Asked about billing.".to_string()),
            ContextEntry::Utterance(Utterance::user("what's your refund policy?")),
            ContextEntry::ToolCall(ToolRequest {
                call_id: "call_1".to_string(),
                name: "answer_from_company_kb".to_string(),
                arguments: json!({"query": "refund policy"}),
            }),
            ContextEntry::ToolResult {
                call_id: "call_1".to_string(),
                name: "answer_from_company_kb".to_string(),
                content: json!({"kind": "knowledge_matches", "matches": []}),
            },
            ContextEntry::Utterance(Utterance::agent("Refunds are available for 30 days.")),
        ];

        let messages = generator.build_messages(&context).unwrap();
        assert_eq!(messages.len(), 6);
        assert!(matches!(messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(messages[1], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(messages[2], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(messages[3], ChatCompletionRequestMessage::Assistant(_)));
        assert!(matches!(messages[4], ChatCompletionRequestMessage::Tool(_)));
        assert!(matches!(messages[5], ChatCompletionRequestMessage::Assistant(_)));
    }

    #[test]
    fn transcript_renders_speakers() {
        let rendered = render_transcript(&[
            Utterance::user("hi"),
            Utterance::agent("hello, how can I help?"),
        ]);
        assert_eq!(rendered, "user: hi\nagent: hello, how can I help?");
    }
}
