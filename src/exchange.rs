// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! The gateway declares exactly one exchange: a topic exchange, so that the
//! incoming queue can be bound with wildcard keys (`*` one word, `#` zero or
//! more words) next to the fixed waitlist key.

use lapin::{options::ExchangeDeclareOptions, ExchangeKind};

/// Definition of a topic exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// A non-durable topic exchange.
    ///
    /// # Parameters
    /// * `name` - The exchange name
    pub fn topic(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Makes the exchange survive broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        ExchangeKind::Topic
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Declare flags: never passive, internal or auto-deleted.
    pub(crate) fn options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: false,
            durable: self.durable,
            auto_delete: false,
            internal: false,
            nowait: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_durable_topic_exchange() {
        let def = ExchangeDefinition::topic("events").durable();
        let options = def.options();

        assert!(matches!(def.kind(), ExchangeKind::Topic));
        assert_eq!(def.name(), "events");
        assert!(options.durable);
        assert!(!options.auto_delete);
        assert!(!options.passive);
        assert!(!options.internal);
    }
}
