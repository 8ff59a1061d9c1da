//! Per-adapter activation switch
//!
//! Every adapter variant composes this capability object; the node dispatcher
//! queries it on each forward call to decide whether the adapter path runs or
//! the base layer is used untouched. New adapters start deactivated.

/// Activation flag shared by all adapter variants
#[derive(Clone, Debug, Default)]
pub struct ActivationState {
    activated: bool,
}

impl ActivationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn set_activation(&mut self, activate: bool) {
        self.activated = activate;
    }
}
