use std::sync::Arc;

use log::info;

use crate::domain::{ArmedPayload, EventKind};
use crate::hub::BroadcastHub;
use crate::register::StateRegister;

/// flips the recording flag and tells everyone.
///
/// the toggle event is published inside the register's write guard, so
/// concurrent toggles and measurement updates reach observers in the order
/// they changed the state.
pub struct ToggleService {
    register: Arc<StateRegister>,
    hub: BroadcastHub,
}

impl ToggleService {
    pub fn new(register: Arc<StateRegister>, hub: BroadcastHub) -> Self {
        Self { register, hub }
    }

    pub fn toggle(&self) -> bool {
        let armed = self.register.toggle_armed_with(|armed| self.announce(armed));
        info!("[TOGGLE] Recording {}", if armed { "armed" } else { "disarmed" });
        armed
    }

    /// explicit set; only a real change is broadcast
    pub fn set(&self, armed: bool) -> bool {
        self.register.set_armed_with(armed, |armed| {
            self.announce(armed);
            info!("[TOGGLE] Recording {}", if armed { "armed" } else { "disarmed" });
        })
    }

    fn announce(&self, armed: bool) {
        self.hub.publish(EventKind::Toggle, &ArmedPayload { activo: armed });
    }
}
