//! Outward-facing engine hooks.
//!
//! The integration layer that embeds this core supplies these traits; the
//! core never touches bodies or navigation directly. [`NullHooks`] is the
//! inert implementation used in tests and headless runs.

use crew_bots_proto::{InstanceId, ItemId, ParticipantId, Vec3};

use crate::behavior::{Intent, Perception};

/// World queries the behavior layer needs answered by the host engine.
pub trait PerceptionHooks {
    fn has_line_of_sight(&self, instance_id: InstanceId, target: ParticipantId) -> bool;
    fn distance_to(&self, instance_id: InstanceId, target: ParticipantId) -> Option<f32>;
}

/// Body and interaction control executed on the owning participant.
pub trait BodyHooks {
    fn set_body_enabled(&mut self, instance_id: InstanceId, enabled: bool);
    fn teleport_body(&mut self, instance_id: InstanceId, position: Vec3, outside: Option<bool>);
    fn play_terminal_animation(&mut self, instance_id: InstanceId);
    fn move_to(&mut self, instance_id: InstanceId, target: Vec3);
    fn interact_with(&mut self, instance_id: InstanceId, target: InstanceId);
    fn pick_up(&mut self, instance_id: InstanceId, item_id: ItemId);
    fn drop_held(&mut self, instance_id: InstanceId);
}

/// Refreshes the engine-answered fields of a perception frame before the
/// owner ticks the machine. The remaining fields come from game events the
/// integration layer tracks itself.
pub fn refresh_perception<P: PerceptionHooks>(
    hooks: &P,
    instance_id: InstanceId,
    perception: &mut Perception,
) {
    if let Some(player) = perception.assigned_player {
        perception.has_line_of_sight = hooks.has_line_of_sight(instance_id, player);
        perception.distance_to_player = hooks.distance_to(instance_id, player);
    } else {
        perception.has_line_of_sight = false;
        perception.distance_to_player = None;
    }
}

/// Maps one tick's behavior intent onto the body hooks.
pub fn execute_intent<B: BodyHooks>(hooks: &mut B, instance_id: InstanceId, intent: &Intent) {
    match intent {
        Intent::MoveTo(target) => hooks.move_to(instance_id, *target),
        Intent::PickUp(item_id) => hooks.pick_up(instance_id, *item_id),
        Intent::DropHeld => hooks.drop_held(instance_id),
        Intent::Interact(target) => hooks.interact_with(instance_id, *target),
        Intent::Hold => {}
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullHooks;

impl PerceptionHooks for NullHooks {
    fn has_line_of_sight(&self, _instance_id: InstanceId, _target: ParticipantId) -> bool {
        false
    }

    fn distance_to(&self, _instance_id: InstanceId, _target: ParticipantId) -> Option<f32> {
        None
    }
}

impl BodyHooks for NullHooks {
    fn set_body_enabled(&mut self, _instance_id: InstanceId, _enabled: bool) {}
    fn teleport_body(&mut self, _instance_id: InstanceId, _position: Vec3, _outside: Option<bool>) {
    }
    fn play_terminal_animation(&mut self, _instance_id: InstanceId) {}
    fn move_to(&mut self, _instance_id: InstanceId, _target: Vec3) {}
    fn interact_with(&mut self, _instance_id: InstanceId, _target: InstanceId) {}
    fn pick_up(&mut self, _instance_id: InstanceId, _item_id: ItemId) {}
    fn drop_held(&mut self, _instance_id: InstanceId) {}
}
