//! Model catalogue
//!
//! Maps model identifiers to their vendor, context window, pricing, and
//! capability flags. The flags drive per-call request shaping: image
//! elision, reasoning replay, tool availability.

use super::{Model, Vendor};

pub fn catalogue() -> Vec<Model> {
    vec![
        Model {
            id: "claude-sonnet-4-20250514".to_string(),
            display_name: "Claude Sonnet 4".to_string(),
            vendor: Vendor::Anthropic,
            context_window: 200_000,
            default_max_tokens: 8_192,
            input_cost_per_million: 3.0,
            output_cost_per_million: 15.0,
            supports_tools: true,
            supports_vision: true,
            supports_reasoning: true,
            replay_reasoning: true,
        },
        Model {
            id: "claude-opus-4-20250514".to_string(),
            display_name: "Claude Opus 4".to_string(),
            vendor: Vendor::Anthropic,
            context_window: 200_000,
            default_max_tokens: 8_192,
            input_cost_per_million: 15.0,
            output_cost_per_million: 75.0,
            supports_tools: true,
            supports_vision: true,
            supports_reasoning: true,
            replay_reasoning: true,
        },
        Model {
            id: "claude-haiku-3-5-20241022".to_string(),
            display_name: "Claude 3.5 Haiku".to_string(),
            vendor: Vendor::Anthropic,
            context_window: 200_000,
            default_max_tokens: 4_096,
            input_cost_per_million: 0.80,
            output_cost_per_million: 4.0,
            supports_tools: true,
            supports_vision: true,
            supports_reasoning: false,
            replay_reasoning: false,
        },
        Model {
            id: "gpt-4o".to_string(),
            display_name: "GPT-4o".to_string(),
            vendor: Vendor::OpenAi,
            context_window: 128_000,
            default_max_tokens: 16_384,
            input_cost_per_million: 2.5,
            output_cost_per_million: 10.0,
            supports_tools: true,
            supports_vision: true,
            supports_reasoning: false,
            replay_reasoning: false,
        },
        Model {
            id: "gpt-4o-mini".to_string(),
            display_name: "GPT-4o Mini".to_string(),
            vendor: Vendor::OpenAi,
            context_window: 128_000,
            default_max_tokens: 16_384,
            input_cost_per_million: 0.15,
            output_cost_per_million: 0.6,
            supports_tools: true,
            supports_vision: true,
            supports_reasoning: false,
            replay_reasoning: false,
        },
        Model {
            id: "o1".to_string(),
            display_name: "o1".to_string(),
            vendor: Vendor::OpenAi,
            context_window: 200_000,
            default_max_tokens: 100_000,
            input_cost_per_million: 15.0,
            output_cost_per_million: 60.0,
            supports_tools: true,
            supports_vision: true,
            supports_reasoning: true,
            replay_reasoning: false,
        },
    ]
}

pub fn lookup(id: &str) -> Option<Model> {
    catalogue().into_iter().find(|m| m.id == id)
}
