// ---------------------------------------------------------------------------
// Action weight table
// ---------------------------------------------------------------------------

use crate::error::EngineError;
use crate::types::ActionKind;

/// Numeric interest strength per interaction kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionWeights {
	pub view: f64,
	pub register: f64,
	pub like: f64,
}

impl Default for ActionWeights {
	fn default() -> Self {
		Self {
			view: 0.4,
			register: 0.8,
			like: 1.0,
		}
	}
}

impl ActionWeights {
	/// Build a table, rejecting non-finite or non-positive weights.
	pub fn new(view: f64, register: f64, like: f64) -> Result<Self, EngineError> {
		let weights = Self {
			view,
			register,
			like,
		};
		weights.validate()?;
		Ok(weights)
	}

	pub fn validate(&self) -> Result<(), EngineError> {
		for (name, value) in [
			("view", self.view),
			("register", self.register),
			("like", self.like),
		] {
			if !value.is_finite() || value <= 0.0 {
				return Err(EngineError::Config(format!(
					"{} weight must be a positive number, got {}",
					name, value
				)));
			}
		}
		Ok(())
	}

	pub fn weight(&self, kind: ActionKind) -> f64 {
		match kind {
			ActionKind::View => self.view,
			ActionKind::Register => self.register,
			ActionKind::Like => self.like,
		}
	}
}
