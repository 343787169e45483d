//! 类型系统模块：定义编排层的请求与响应数据类型。
//!
//! # Types Module
//!
//! This module defines the request and response shapes for the four public
//! orchestration operations, plus the shared usage/metadata primitives that
//! flow through metrics and caching.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`GenerateTextRequest`] / [`GenerateTextResponse`] | Free-form text generation |
//! | [`GenerateTopicsRequest`] / [`GenerateTopicsResponse`] | Topic extraction from source material |
//! | [`OptimizeContentRequest`] / [`OptimizeContentResponse`] | Content rewriting with scored improvements |
//! | [`ChatRequest`] / [`ChatResponse`] | Conversational turns (never cached) |
//! | [`TokenUsage`] | Prompt/completion token accounting |
//! | [`ResponseMetadata`] | Per-dispatch attribution (service, model, duration, cached) |

pub mod request;
pub mod response;

pub use request::{
    ChatRequest, GenerateTextRequest, GenerateTopicsRequest, OptimizeContentRequest,
};
pub use response::{
    ChatMessage, ChatResponse, GenerateTextResponse, GenerateTopicsResponse,
    OptimizeContentResponse, ResponseMetadata, TokenUsage,
};
