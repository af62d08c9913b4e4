#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chatframe** — a provider-agnostic, schema-driven LLM chat client.
//!
//! One engine, any provider: a [`schema::SchemaDoc`] declares a provider's
//! wire contract — endpoint, auth, request shape, parameter constraints,
//! response extraction paths — as data, not code. A [`context::Context`]
//! bound to that schema accumulates a conversation and knows how to turn
//! itself into a request body, and how to pull a reply back out of
//! whatever shape the provider answers with. A [`facade::ChatClient`]
//! wires a `Context` to an [`sink::HttpSink`] for blocking, async, or
//! streaming sends.
//!
//! ## Security
//!
//! - **Memory-safe secrets**: API keys are wrapped in `secrecy::Secret` and
//!   never appear in `Debug` output or logs, and are zeroized on drop.
//! - **TLS on by default**: the bundled [`sink::ReqwestSink`] verifies
//!   certificates and negotiates HTTP/2 where available.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatframe::config::GatewayConfig;
//! use chatframe::context::{Context, ContextConfig};
//! use chatframe::facade::{never_cancel, ChatClient};
//! use chatframe::registry::SchemaRegistry;
//! use chatframe::sink::ReqwestSink;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::from_env();
//!
//! let registry = SchemaRegistry::new();
//! registry.set_directory("schemas");
//! let schema = registry.load(config.default_provider())?;
//!
//! let mut context = Context::new(schema, config.context_config())?;
//! if let Some(key) = config.api_key_for(config.default_provider()) {
//!     use secrecy::ExposeSecret;
//!     context.set_api_key(key.expose_secret().clone());
//! }
//!
//! let client = ChatClient::new(ReqwestSink::new(config.timeout())?);
//! let reply = client
//!     .send_async(&mut context, "Explain Rust ownership", None, None, false, never_cancel())
//!     .await?;
//! println!("{reply}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod facade;
pub mod factory;
pub mod registry;
pub mod schema;
pub mod sink;
pub mod stream;

pub use config::GatewayConfig;
pub use context::{Context, ContextConfig};
pub use error::{Error, ResponseShapeError, Result, SchemaError, TransportError, ValidationError};
pub use facade::ChatClient;
pub use factory::ContextFactory;
pub use registry::SchemaRegistry;
pub use schema::SchemaDoc;
pub use sink::{HttpSink, ReqwestSink};
