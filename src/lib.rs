// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod config;
pub mod connection;
pub mod consumer;
pub mod container;
pub mod errors;
pub mod exchange;
pub mod gateway;
pub mod publisher;
pub mod queue;
pub mod shutdown;
pub mod topology;

pub use config::BrokerProperties;
pub use consumer::{Acknowledgement, InboundMessage, MessageHandler};
pub use errors::GatewayError;
pub use gateway::{BrokerGateway, GatewayBuilder, GatewayStatus};
