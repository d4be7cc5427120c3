//! Perception-driven behavior state machine.
//!
//! Each live bot carries one [`BehaviorMachine`]. Only the owning
//! participant ticks it; everyone else mirrors the machine from replicated
//! [`StateSnapshot`]s. Transitions are data: every state has a fixed,
//! ordered table of (predicate, target) rules evaluated top-down, first hit
//! wins, at most one hop per tick. Timers belong to the state and reset on
//! entry, not on every tick.
//!
//! Priority convention across tables: a forced environmental action
//! (inverse teleport) outranks everything, then threat interrupts (Panik,
//! FightEnemy), then state-specific rules. `UseInverseTeleport` itself is
//! uninterruptible; its table only contains its own completion.

use serde::{Deserialize, Serialize};

use crew_bots_proto::{
    BehaviorState, InstanceId, ItemId, ParticipantId, PerceptionSummary, StateSnapshot, Vec3,
};

// Ticks are simulation-loop steps on the owning participant.
pub const BRAINDEAD_SETTLE_TICKS: u64 = 30;
pub const SEARCH_GIVE_UP_TICKS: u64 = 600;
pub const LOST_PLAYER_GRACE_TICKS: u64 = 120;
pub const LOCKED_DOOR_WAIT_TICKS: u64 = 90;
pub const INVERSE_TELEPORT_TICKS: u64 = 45;
pub const TZP_INHALE_TICKS: u64 = 60;
pub const MISSION_CONTROL_TICKS: u64 = 150;
pub const SHIP_RESTLESS_TICKS: u64 = 300;

pub const PANIC_ENTER_THRESHOLD: f32 = 0.7;
pub const PANIC_EXIT_THRESHOLD: f32 = 0.3;
pub const FEAR_RISE_ENEMY: f32 = 0.08;
pub const FEAR_RISE_HAZARD: f32 = 0.04;
pub const FEAR_DECAY: f32 = 0.01;
pub const FEAR_DECAY_TZP: f32 = 0.05;

pub const CLOSE_ENOUGH_M: f32 = 3.0;
pub const TOO_FAR_M: f32 = 8.0;
pub const LOSE_SIGHT_M: f32 = 25.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Scrap,
    Key,
    TzpInhalant,
    Chargeable,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeldItem {
    pub item_id: ItemId,
    pub kind: ItemKind,
    pub battery_low: bool,
}

/// Everything the machine senses in one tick. Gathered by the owning
/// participant from the host-engine perception hooks; replicated only in
/// summary form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Perception {
    pub assigned_player: Option<ParticipantId>,
    pub player_position: Option<Vec3>,
    pub distance_to_player: Option<f32>,
    pub has_line_of_sight: bool,
    pub player_in_cruiser: bool,
    pub held_item: Option<HeldItem>,
    pub enemy_nearby: bool,
    pub hazard_nearby: bool,
    pub near_ship: bool,
    pub inside_facility: bool,
    pub locked_door_ahead: bool,
    pub scrap_visible: bool,
    pub nearest_scrap: Option<(ItemId, Vec3)>,
    pub sell_window_open: bool,
    pub inverse_teleport_triggered: bool,
    pub ship_position: Vec3,
}

impl Perception {
    fn sees_player(&self) -> bool {
        self.assigned_player.is_some()
            && self.has_line_of_sight
            && self
                .distance_to_player
                .map(|distance| distance <= LOSE_SIGHT_M)
                .unwrap_or(false)
    }

    fn holds_kind(&self, kind: ItemKind) -> bool {
        self.held_item.map(|held| held.kind == kind).unwrap_or(false)
    }

    fn held_battery_low(&self) -> bool {
        self.held_item.map(|held| held.battery_low).unwrap_or(false)
    }
}

/// Movement or interaction the owner should execute through the body hooks
/// this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Intent {
    MoveTo(Vec3),
    PickUp(ItemId),
    DropHeld,
    Interact(ItemId),
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BehaviorState,
    pub to: BehaviorState,
}

type Predicate = fn(&BehaviorMachine, &Perception) -> bool;

pub struct TransitionRule {
    pub target: BehaviorState,
    pub when: Predicate,
    pub label: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorMachine {
    state: BehaviorState,
    ticks_in_state: u64,
    fear: f32,
}

impl Default for BehaviorMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BehaviorMachine {
    pub fn new() -> Self {
        Self {
            state: BehaviorState::BrainDead,
            ticks_in_state: 0,
            fear: 0.0,
        }
    }

    /// Start mid-flight in a given state; replication installs state
    /// through [`Self::apply_snapshot`] instead.
    #[cfg(test)]
    fn resume(state: BehaviorState, fear: f32) -> Self {
        Self {
            state,
            ticks_in_state: 0,
            fear: fear.clamp(0.0, 1.0),
        }
    }

    pub fn state(&self) -> BehaviorState {
        self.state
    }

    pub fn fear(&self) -> f32 {
        self.fear
    }

    pub fn ticks_in_state(&self) -> u64 {
        self.ticks_in_state
    }

    /// One owner-side simulation step: accumulate fear, then evaluate the
    /// current state's table top-down. At most one transition per tick.
    pub fn tick(&mut self, perception: &Perception) -> Option<Transition> {
        self.ticks_in_state = self.ticks_in_state.saturating_add(1);
        self.update_fear(perception);

        for rule in transitions_for(self.state) {
            if (rule.when)(self, perception) {
                let transition = Transition {
                    from: self.state,
                    to: rule.target,
                };
                self.state = rule.target;
                self.ticks_in_state = 0;
                return Some(transition);
            }
        }
        None
    }

    fn update_fear(&mut self, perception: &Perception) {
        let mut fear = self.fear;
        if perception.enemy_nearby {
            fear += FEAR_RISE_ENEMY;
        }
        if perception.hazard_nearby {
            fear += FEAR_RISE_HAZARD;
        }
        if !perception.enemy_nearby && !perception.hazard_nearby {
            fear -= if self.state == BehaviorState::UseTzpInhalant {
                FEAR_DECAY_TZP
            } else {
                FEAR_DECAY
            };
        }
        self.fear = fear.clamp(0.0, 1.0);
    }

    /// What the owner should do this tick given the current state. Pure
    /// mapping; execution goes through the body hooks.
    pub fn intent(&self, perception: &Perception) -> Intent {
        match self.state {
            BehaviorState::GetCloseToPlayer
            | BehaviorState::JustLostPlayer
            | BehaviorState::SearchingForPlayer => match perception.player_position {
                Some(position) => Intent::MoveTo(position),
                None => Intent::Hold,
            },
            BehaviorState::FetchingObject | BehaviorState::CollectScrapToSell => {
                match perception.nearest_scrap {
                    Some((item_id, position)) => {
                        if perception.held_item.is_some() {
                            Intent::Hold
                        } else if close_to(perception, position) {
                            Intent::PickUp(item_id)
                        } else {
                            Intent::MoveTo(position)
                        }
                    }
                    None => Intent::Hold,
                }
            }
            BehaviorState::ReturnToShip | BehaviorState::Panik => {
                Intent::MoveTo(perception.ship_position)
            }
            BehaviorState::SellScrap => Intent::DropHeld,
            BehaviorState::UseKeyOnLockedDoor | BehaviorState::ChargeHeldItem => {
                match perception.held_item {
                    Some(held) => Intent::Interact(held.item_id),
                    None => Intent::Hold,
                }
            }
            _ => Intent::Hold,
        }
    }

    pub fn snapshot(&self, instance_id: InstanceId, perception: &Perception) -> StateSnapshot {
        StateSnapshot {
            instance_id,
            state: self.state,
            perception: PerceptionSummary {
                fear_level: self.fear,
                assigned_player: perception.assigned_player,
                held_item: perception.held_item.map(|held| held.item_id),
            },
        }
    }

    /// Non-owner mirror path. Never evaluates transitions; just adopts the
    /// replicated state. The entry timer resets only when the state actually
    /// changed.
    pub fn apply_snapshot(&mut self, snapshot: &StateSnapshot) {
        if self.state != snapshot.state {
            self.state = snapshot.state;
            self.ticks_in_state = 0;
        }
        self.fear = snapshot.perception.fear_level.clamp(0.0, 1.0);
    }
}

fn close_to(perception: &Perception, _position: Vec3) -> bool {
    // Proximity to items is a hook-side query; the nearest-scrap entry is
    // only present when the item is reachable, so distance falls back to
    // the player distance heuristic.
    perception
        .distance_to_player
        .map(|distance| distance <= CLOSE_ENOUGH_M)
        .unwrap_or(true)
}

// ---------------------------------------------------------------------
// Transition tables
// ---------------------------------------------------------------------

const fn rule(target: BehaviorState, when: Predicate, label: &'static str) -> TransitionRule {
    TransitionRule {
        target,
        when,
        label,
    }
}

fn forced_teleport(_machine: &BehaviorMachine, perception: &Perception) -> bool {
    perception.inverse_teleport_triggered
}

fn fear_above_panic(machine: &BehaviorMachine, _perception: &Perception) -> bool {
    machine.fear >= PANIC_ENTER_THRESHOLD
}

fn brave_enemy_contact(machine: &BehaviorMachine, perception: &Perception) -> bool {
    perception.enemy_nearby && machine.fear < PANIC_ENTER_THRESHOLD
}

fn player_missing(_machine: &BehaviorMachine, perception: &Perception) -> bool {
    perception.assigned_player.is_none()
}

fn sees_player(_machine: &BehaviorMachine, perception: &Perception) -> bool {
    perception.sees_player()
}

// Shared interrupt block, spliced at the head of every passive state table.
const INTERRUPT_TELEPORT: TransitionRule = rule(
    BehaviorState::UseInverseTeleport,
    forced_teleport,
    "inverse teleport triggered",
);
const INTERRUPT_PANIC: TransitionRule =
    rule(BehaviorState::Panik, fear_above_panic, "fear above threshold");
const INTERRUPT_FIGHT: TransitionRule = rule(
    BehaviorState::FightEnemy,
    brave_enemy_contact,
    "enemy contact below fear threshold",
);

static BRAIN_DEAD: &[TransitionRule] = &[rule(
    BehaviorState::SearchingForPlayer,
    |machine, _| machine.ticks_in_state >= BRAINDEAD_SETTLE_TICKS,
    "settled",
)];

static SEARCHING_FOR_PLAYER: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(BehaviorState::GetCloseToPlayer, sees_player, "player sighted"),
    rule(
        BehaviorState::LostInFacility,
        |machine, perception| machine.ticks_in_state >= SEARCH_GIVE_UP_TICKS && perception.inside_facility,
        "gave up inside",
    ),
    rule(
        BehaviorState::ReturnToShip,
        |machine, perception| machine.ticks_in_state >= SEARCH_GIVE_UP_TICKS && !perception.inside_facility,
        "gave up outside",
    ),
];

static GET_CLOSE_TO_PLAYER: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(BehaviorState::SearchingForPlayer, player_missing, "target gone"),
    rule(
        BehaviorState::PlayerInCruiser,
        |_, perception| perception.player_in_cruiser,
        "player boarded cruiser",
    ),
    rule(
        BehaviorState::UseKeyOnLockedDoor,
        |_, perception| perception.locked_door_ahead && perception.holds_kind(ItemKind::Key),
        "locked door with key",
    ),
    rule(
        BehaviorState::ChillWithPlayer,
        |_, perception| {
            perception
                .distance_to_player
                .map(|distance| distance <= CLOSE_ENOUGH_M)
                .unwrap_or(false)
        },
        "close enough",
    ),
    rule(
        BehaviorState::JustLostPlayer,
        |_, perception| !perception.sees_player(),
        "lost sight",
    ),
];

static JUST_LOST_PLAYER: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(BehaviorState::SearchingForPlayer, player_missing, "target gone"),
    rule(BehaviorState::GetCloseToPlayer, sees_player, "player reacquired"),
    rule(
        BehaviorState::SearchingForPlayer,
        |machine, _| machine.ticks_in_state >= LOST_PLAYER_GRACE_TICKS,
        "grace elapsed",
    ),
];

static CHILL_WITH_PLAYER: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(BehaviorState::SearchingForPlayer, player_missing, "target gone"),
    rule(
        BehaviorState::PlayerInCruiser,
        |_, perception| perception.player_in_cruiser,
        "player boarded cruiser",
    ),
    rule(
        BehaviorState::UseTzpInhalant,
        |machine, perception| {
            perception.holds_kind(ItemKind::TzpInhalant) && machine.fear >= PANIC_EXIT_THRESHOLD
        },
        "calm down with inhalant",
    ),
    rule(
        BehaviorState::ChargeHeldItem,
        |_, perception| perception.held_battery_low() && perception.near_ship,
        "held item needs charge",
    ),
    rule(
        BehaviorState::FetchingObject,
        |_, perception| perception.scrap_visible && perception.held_item.is_none(),
        "scrap spotted",
    ),
    rule(
        BehaviorState::GetCloseToPlayer,
        |_, perception| {
            perception
                .distance_to_player
                .map(|distance| distance > TOO_FAR_M)
                .unwrap_or(false)
        },
        "player drifted away",
    ),
];

static FETCHING_OBJECT: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(
        BehaviorState::UseKeyOnLockedDoor,
        |_, perception| perception.locked_door_ahead && perception.holds_kind(ItemKind::Key),
        "locked door with key",
    ),
    rule(
        BehaviorState::GetCloseToPlayer,
        |_, perception| perception.held_item.is_some() && perception.assigned_player.is_some(),
        "object secured",
    ),
    rule(
        BehaviorState::ReturnToShip,
        |_, perception| perception.held_item.is_some() && perception.assigned_player.is_none(),
        "object secured, no target",
    ),
    rule(
        BehaviorState::SearchingForPlayer,
        |_, perception| !perception.scrap_visible && perception.held_item.is_none(),
        "object gone",
    ),
];

static PLAYER_IN_CRUISER: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(BehaviorState::SearchingForPlayer, player_missing, "target gone"),
    rule(
        BehaviorState::GetCloseToPlayer,
        |_, perception| !perception.player_in_cruiser,
        "player left cruiser",
    ),
];

static PANIK: &[TransitionRule] = &[
    rule(
        BehaviorState::UseInverseTeleport,
        forced_teleport,
        "inverse teleport triggered",
    ),
    rule(
        BehaviorState::UseTzpInhalant,
        |_, perception| perception.holds_kind(ItemKind::TzpInhalant),
        "inhalant on hand",
    ),
    rule(
        BehaviorState::GetCloseToPlayer,
        |machine, perception| {
            machine.fear <= PANIC_EXIT_THRESHOLD && perception.assigned_player.is_some()
        },
        "calmed down, target known",
    ),
    rule(
        BehaviorState::SearchingForPlayer,
        |machine, _| machine.fear <= PANIC_EXIT_THRESHOLD,
        "calmed down",
    ),
];

static RETURN_TO_SHIP: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(
        BehaviorState::ChillAtShip,
        |_, perception| perception.near_ship,
        "arrived at ship",
    ),
    rule(BehaviorState::GetCloseToPlayer, sees_player, "player sighted"),
];

static CHILL_AT_SHIP: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(BehaviorState::GetCloseToPlayer, sees_player, "player sighted"),
    rule(
        BehaviorState::CollectScrapToSell,
        |_, perception| perception.sell_window_open && perception.scrap_visible,
        "sell window open",
    ),
    rule(
        BehaviorState::ChargeHeldItem,
        |_, perception| perception.held_battery_low(),
        "held item needs charge",
    ),
    rule(
        BehaviorState::MissionControl,
        |machine, _| machine.ticks_in_state >= SHIP_RESTLESS_TICKS,
        "restless at ship",
    ),
];

static SEARCHING_FOR_SCRAP: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(
        BehaviorState::FetchingObject,
        |_, perception| perception.scrap_visible,
        "scrap sighted",
    ),
    rule(
        BehaviorState::ReturnToShip,
        |machine, _| machine.ticks_in_state >= SEARCH_GIVE_UP_TICKS,
        "gave up",
    ),
];

// Uninterruptible: a teleport in progress finishes no matter what.
static USE_INVERSE_TELEPORT: &[TransitionRule] = &[rule(
    BehaviorState::LostInFacility,
    |machine, _| machine.ticks_in_state >= INVERSE_TELEPORT_TICKS,
    "teleport complete",
)];

static USE_KEY_ON_LOCKED_DOOR: &[TransitionRule] = &[
    rule(
        BehaviorState::UseInverseTeleport,
        forced_teleport,
        "inverse teleport triggered",
    ),
    rule(BehaviorState::Panik, fear_above_panic, "fear above threshold"),
    rule(
        BehaviorState::SearchingForPlayer,
        |_, perception| !perception.locked_door_ahead,
        "door opened",
    ),
    rule(
        BehaviorState::SearchingForPlayer,
        |machine, _| machine.ticks_in_state >= LOCKED_DOOR_WAIT_TICKS,
        "gave up on door",
    ),
];

static MISSION_CONTROL: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(
        BehaviorState::SellScrap,
        |_, perception| perception.sell_window_open && perception.held_item.is_some(),
        "sell window open",
    ),
    rule(
        BehaviorState::ChillAtShip,
        |machine, _| machine.ticks_in_state >= MISSION_CONTROL_TICKS,
        "shift over",
    ),
];

static SELL_SCRAP: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(
        BehaviorState::CollectScrapToSell,
        |_, perception| perception.held_item.is_none() && perception.scrap_visible,
        "hands free, more scrap",
    ),
    rule(
        BehaviorState::ChillAtShip,
        |_, perception| !perception.sell_window_open,
        "sell window closed",
    ),
];

static COLLECT_SCRAP_TO_SELL: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(
        BehaviorState::SellScrap,
        |_, perception| perception.held_item.is_some(),
        "scrap in hand",
    ),
    rule(
        BehaviorState::ChillAtShip,
        |_, perception| !perception.scrap_visible,
        "nothing left to collect",
    ),
];

static FIGHT_ENEMY: &[TransitionRule] = &[
    rule(
        BehaviorState::UseInverseTeleport,
        forced_teleport,
        "inverse teleport triggered",
    ),
    rule(BehaviorState::Panik, fear_above_panic, "overwhelmed"),
    rule(
        BehaviorState::GetCloseToPlayer,
        |_, perception| !perception.enemy_nearby && perception.assigned_player.is_some(),
        "enemy gone, target known",
    ),
    rule(
        BehaviorState::SearchingForPlayer,
        |_, perception| !perception.enemy_nearby,
        "enemy gone",
    ),
];

static CHARGE_HELD_ITEM: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(
        BehaviorState::ChillAtShip,
        |_, perception| !perception.held_battery_low(),
        "charge complete",
    ),
    rule(
        BehaviorState::ChillAtShip,
        |_, perception| perception.held_item.is_none(),
        "nothing to charge",
    ),
];

static USE_TZP_INHALANT: &[TransitionRule] = &[
    rule(
        BehaviorState::UseInverseTeleport,
        forced_teleport,
        "inverse teleport triggered",
    ),
    rule(
        BehaviorState::GetCloseToPlayer,
        |machine, perception| {
            machine.ticks_in_state >= TZP_INHALE_TICKS && perception.assigned_player.is_some()
        },
        "done inhaling, target known",
    ),
    rule(
        BehaviorState::SearchingForPlayer,
        |machine, _| machine.ticks_in_state >= TZP_INHALE_TICKS,
        "done inhaling",
    ),
];

static LOST_IN_FACILITY: &[TransitionRule] = &[
    INTERRUPT_TELEPORT,
    INTERRUPT_PANIC,
    INTERRUPT_FIGHT,
    rule(BehaviorState::GetCloseToPlayer, sees_player, "player sighted"),
    rule(
        BehaviorState::UseKeyOnLockedDoor,
        |_, perception| perception.locked_door_ahead && perception.holds_kind(ItemKind::Key),
        "locked door with key",
    ),
    rule(
        BehaviorState::FetchingObject,
        |_, perception| perception.scrap_visible && perception.held_item.is_none(),
        "scrap spotted while lost",
    ),
    rule(
        BehaviorState::SearchingForScrap,
        |machine, _| machine.ticks_in_state >= SEARCH_GIVE_UP_TICKS,
        "wandering turned scavenging",
    ),
];

/// The fixed, ordered transition table of a state. Public so coverage and
/// priority are inspectable and testable per state.
pub fn transitions_for(state: BehaviorState) -> &'static [TransitionRule] {
    match state {
        BehaviorState::BrainDead => BRAIN_DEAD,
        BehaviorState::SearchingForPlayer => SEARCHING_FOR_PLAYER,
        BehaviorState::GetCloseToPlayer => GET_CLOSE_TO_PLAYER,
        BehaviorState::JustLostPlayer => JUST_LOST_PLAYER,
        BehaviorState::ChillWithPlayer => CHILL_WITH_PLAYER,
        BehaviorState::FetchingObject => FETCHING_OBJECT,
        BehaviorState::PlayerInCruiser => PLAYER_IN_CRUISER,
        BehaviorState::Panik => PANIK,
        BehaviorState::ReturnToShip => RETURN_TO_SHIP,
        BehaviorState::ChillAtShip => CHILL_AT_SHIP,
        BehaviorState::SearchingForScrap => SEARCHING_FOR_SCRAP,
        BehaviorState::UseInverseTeleport => USE_INVERSE_TELEPORT,
        BehaviorState::UseKeyOnLockedDoor => USE_KEY_ON_LOCKED_DOOR,
        BehaviorState::MissionControl => MISSION_CONTROL,
        BehaviorState::SellScrap => SELL_SCRAP,
        BehaviorState::CollectScrapToSell => COLLECT_SCRAP_TO_SELL,
        BehaviorState::FightEnemy => FIGHT_ENEMY,
        BehaviorState::ChargeHeldItem => CHARGE_HELD_ITEM,
        BehaviorState::UseTzpInhalant => USE_TZP_INHALANT,
        BehaviorState::LostInFacility => LOST_IN_FACILITY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(state: BehaviorState) -> BehaviorMachine {
        BehaviorMachine::resume(state, 0.0)
    }

    fn player_in_view() -> Perception {
        Perception {
            assigned_player: Some(1),
            player_position: Some(Vec3::new(1.0, 0.0, 0.0)),
            distance_to_player: Some(10.0),
            has_line_of_sight: true,
            ..Perception::default()
        }
    }

    #[test]
    fn spawn_settles_before_searching() {
        let mut machine = BehaviorMachine::new();
        let perception = Perception::default();
        for _ in 0..BRAINDEAD_SETTLE_TICKS - 1 {
            assert_eq!(machine.tick(&perception), None);
        }
        let transition = machine.tick(&perception).expect("settle transition");
        assert_eq!(transition.to, BehaviorState::SearchingForPlayer);
    }

    #[test]
    fn fear_crossing_threshold_enters_panik_on_the_same_tick() {
        let mut machine = BehaviorMachine::resume(BehaviorState::SearchingForPlayer, 0.65);
        let perception = Perception {
            enemy_nearby: true,
            ..Perception::default()
        };
        // 0.65 + FEAR_RISE_ENEMY crosses the threshold during this tick.
        let transition = machine.tick(&perception).expect("panic transition");
        assert_eq!(transition.to, BehaviorState::Panik);
    }

    #[test]
    fn panik_exits_once_fear_decays() {
        let mut machine = BehaviorMachine::resume(BehaviorState::Panik, PANIC_EXIT_THRESHOLD + 0.02);
        let calm = player_in_view();
        let mut entered = None;
        for _ in 0..10 {
            if let Some(transition) = machine.tick(&calm) {
                entered = Some(transition.to);
                break;
            }
        }
        assert_eq!(entered, Some(BehaviorState::GetCloseToPlayer));
    }

    #[test]
    fn at_most_one_transition_per_tick() {
        // ChillAtShip with a visible player also satisfies deeper rules, but
        // a single tick may only hop once.
        let mut machine = machine_in(BehaviorState::ChillAtShip);
        let mut perception = player_in_view();
        perception.distance_to_player = Some(2.0);
        let transition = machine.tick(&perception).expect("one hop");
        assert_eq!(transition.to, BehaviorState::GetCloseToPlayer);
        assert_eq!(machine.state(), BehaviorState::GetCloseToPlayer);
    }

    #[test]
    fn missing_target_falls_back_to_searching() {
        for state in [
            BehaviorState::GetCloseToPlayer,
            BehaviorState::JustLostPlayer,
            BehaviorState::ChillWithPlayer,
            BehaviorState::PlayerInCruiser,
        ] {
            let mut machine = machine_in(state);
            let transition = machine.tick(&Perception::default()).expect("fallback");
            assert_eq!(
                transition.to,
                BehaviorState::SearchingForPlayer,
                "from {state:?}"
            );
        }
    }

    #[test]
    fn inverse_teleport_preempts_threat_interrupts() {
        let mut machine = BehaviorMachine::resume(BehaviorState::SearchingForScrap, 0.9);
        let perception = Perception {
            enemy_nearby: true,
            inverse_teleport_triggered: true,
            ..Perception::default()
        };
        let transition = machine.tick(&perception).expect("teleport wins");
        assert_eq!(transition.to, BehaviorState::UseInverseTeleport);
    }

    #[test]
    fn inverse_teleport_is_uninterruptible() {
        let mut machine = machine_in(BehaviorState::UseInverseTeleport);
        let threat = Perception {
            enemy_nearby: true,
            hazard_nearby: true,
            ..Perception::default()
        };
        for _ in 0..INVERSE_TELEPORT_TICKS - 1 {
            assert_eq!(machine.tick(&threat), None, "teleport must finish");
        }
        let transition = machine.tick(&threat).expect("teleport completes");
        assert_eq!(transition.to, BehaviorState::LostInFacility);
    }

    #[test]
    fn threat_preempts_passive_scavenging() {
        let mut machine = BehaviorMachine::resume(BehaviorState::SearchingForScrap, 0.2);
        let perception = Perception {
            enemy_nearby: true,
            scrap_visible: true,
            ..Perception::default()
        };
        let transition = machine.tick(&perception).expect("interrupt");
        assert_eq!(transition.to, BehaviorState::FightEnemy);
    }

    #[test]
    fn fetch_completes_back_to_player() {
        let mut machine = machine_in(BehaviorState::FetchingObject);
        let perception = Perception {
            assigned_player: Some(1),
            held_item: Some(HeldItem {
                item_id: 500,
                kind: ItemKind::Scrap,
                battery_low: false,
            }),
            ..Perception::default()
        };
        let transition = machine.tick(&perception).expect("fetch done");
        assert_eq!(transition.to, BehaviorState::GetCloseToPlayer);
    }

    #[test]
    fn locked_door_times_out() {
        let mut machine = machine_in(BehaviorState::UseKeyOnLockedDoor);
        let perception = Perception {
            locked_door_ahead: true,
            held_item: Some(HeldItem {
                item_id: 7,
                kind: ItemKind::Key,
                battery_low: false,
            }),
            ..Perception::default()
        };
        for _ in 0..LOCKED_DOOR_WAIT_TICKS - 1 {
            assert_eq!(machine.tick(&perception), None);
        }
        let transition = machine.tick(&perception).expect("door timeout");
        assert_eq!(transition.to, BehaviorState::SearchingForPlayer);
    }

    #[test]
    fn timers_reset_on_entry_not_per_tick() {
        let mut machine = machine_in(BehaviorState::JustLostPlayer);
        let blind = Perception {
            assigned_player: Some(1),
            ..Perception::default()
        };
        for _ in 0..LOST_PLAYER_GRACE_TICKS / 2 {
            machine.tick(&blind);
        }
        assert_eq!(machine.ticks_in_state(), LOST_PLAYER_GRACE_TICKS / 2);
        // Reacquiring the player resets the timer through a state change.
        machine.tick(&player_in_view());
        assert_eq!(machine.state(), BehaviorState::GetCloseToPlayer);
        assert_eq!(machine.ticks_in_state(), 0);
    }

    #[test]
    fn snapshot_apply_mirrors_without_transitioning() {
        let owner = BehaviorMachine::resume(BehaviorState::Panik, 0.8);
        let mut mirror = BehaviorMachine::new();
        let snapshot = owner.snapshot(1_000_000, &Perception::default());
        mirror.apply_snapshot(&snapshot);
        assert_eq!(mirror.state(), BehaviorState::Panik);
        assert!((mirror.fear() - 0.8).abs() < f32::EPSILON);

        // Re-applying the identical snapshot must not reset the entry timer.
        let again = owner.snapshot(1_000_000, &Perception::default());
        mirror.ticks_in_state = 1;
        mirror.apply_snapshot(&again);
        assert_eq!(mirror.ticks_in_state(), 1);
    }

    #[test]
    fn every_state_has_a_table() {
        for state in [
            BehaviorState::BrainDead,
            BehaviorState::SearchingForPlayer,
            BehaviorState::GetCloseToPlayer,
            BehaviorState::JustLostPlayer,
            BehaviorState::ChillWithPlayer,
            BehaviorState::FetchingObject,
            BehaviorState::PlayerInCruiser,
            BehaviorState::Panik,
            BehaviorState::ReturnToShip,
            BehaviorState::ChillAtShip,
            BehaviorState::SearchingForScrap,
            BehaviorState::UseInverseTeleport,
            BehaviorState::UseKeyOnLockedDoor,
            BehaviorState::MissionControl,
            BehaviorState::SellScrap,
            BehaviorState::CollectScrapToSell,
            BehaviorState::FightEnemy,
            BehaviorState::ChargeHeldItem,
            BehaviorState::UseTzpInhalant,
            BehaviorState::LostInFacility,
        ] {
            assert!(
                !transitions_for(state).is_empty(),
                "state {state:?} has no transitions"
            );
        }
    }

    #[test]
    fn intent_for_fetching_targets_the_scrap() {
        let machine = machine_in(BehaviorState::FetchingObject);
        let perception = Perception {
            scrap_visible: true,
            nearest_scrap: Some((500, Vec3::new(4.0, 0.0, 0.0))),
            distance_to_player: Some(20.0),
            ..Perception::default()
        };
        assert_eq!(
            machine.intent(&perception),
            Intent::MoveTo(Vec3::new(4.0, 0.0, 0.0))
        );
    }
}
