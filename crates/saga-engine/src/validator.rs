//! Design-time checks over a saga type's declarations.
//!
//! Runs once per saga type at registration. Structural requirements such as
//! an id accessor, a state accessor or the handler signatures are enforced by
//! the [`Saga`] traits at compile time; the rules below cover what the type
//! system cannot express.

use thiserror::Error;

use crate::registration::{RegistrationBuilder, Stage};
use crate::saga::{MessageType, Saga};

/// A single structural problem with a saga type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("saga type name is empty")]
    EmptySagaType,

    #[error("no start message declared")]
    NoStartMessage,

    /// One message type declared in two different stages.
    #[error("message {message_type} is declared as both {first} and {second}")]
    ConflictingStages {
        message_type: MessageType,
        first: Stage,
        second: Stage,
    },

    #[error("message {message_type} is declared twice as {stage}")]
    DuplicateHandler {
        message_type: MessageType,
        stage: Stage,
    },

    /// A step or compensate message without a correlation strategy.
    #[error("{stage} message {message_type} has no correlation strategy")]
    MissingCorrelation {
        message_type: MessageType,
        stage: Stage,
    },

    #[error("correlation strategy for {message_type} has no step or compensate handler")]
    OrphanCorrelation { message_type: MessageType },

    #[error("correlation strategy for {message_type} is declared more than once")]
    DuplicateCorrelation { message_type: MessageType },

    /// Reported at run time when the creation hook did not set an id.
    #[error("creation hook left the saga id empty")]
    EmptySagaId,
}

/// Checks the declarations of `S` and returns every violation found.
pub(crate) fn validate<S: Saga>(
    saga_type: &str,
    builder: &RegistrationBuilder<S>,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    if saga_type.trim().is_empty() {
        violations.push(Violation::EmptySagaType);
    }

    if !builder
        .handlers
        .iter()
        .any(|declaration| declaration.stage == Stage::Start)
    {
        violations.push(Violation::NoStartMessage);
    }

    for (index, declaration) in builder.handlers.iter().enumerate() {
        let earlier = builder.handlers[..index]
            .iter()
            .find(|other| other.message_type == declaration.message_type);
        match earlier {
            Some(other) if other.stage == declaration.stage => {
                violations.push(Violation::DuplicateHandler {
                    message_type: declaration.message_type,
                    stage: declaration.stage,
                });
            }
            Some(other) => {
                violations.push(Violation::ConflictingStages {
                    message_type: declaration.message_type,
                    first: other.stage,
                    second: declaration.stage,
                });
            }
            None => {}
        }
    }

    for declaration in builder
        .handlers
        .iter()
        .filter(|declaration| declaration.stage.requires_correlation())
    {
        let correlated = builder
            .correlations
            .iter()
            .any(|correlation| correlation.message_type == declaration.message_type);
        let missing = Violation::MissingCorrelation {
            message_type: declaration.message_type,
            stage: declaration.stage,
        };
        if !correlated && !violations.contains(&missing) {
            violations.push(missing);
        }
    }

    for (index, correlation) in builder.correlations.iter().enumerate() {
        let duplicate = builder.correlations[..index]
            .iter()
            .any(|other| other.message_type == correlation.message_type);
        if duplicate {
            violations.push(Violation::DuplicateCorrelation {
                message_type: correlation.message_type,
            });
            continue;
        }

        let handled = builder.handlers.iter().any(|declaration| {
            declaration.message_type == correlation.message_type
                && declaration.stage.requires_correlation()
        });
        if !handled {
            violations.push(Violation::OrphanCorrelation {
                message_type: correlation.message_type,
            });
        }
    }

    violations
}
