//! Routing policy engine: the directed routing multigraph, scenario presets,
//! mute/broadcast flags, and conference groups.
//!
//! All state lives behind a single [`parking_lot::RwLock`], mirroring the
//! teacher's `PushHub`/gateway state pattern of one lock guarding a cohesive
//! block of in-memory state rather than one lock per field. The hot path
//! (`get_routes`, called once per inbound audio packet) takes a read lock
//! for the duration of an O(targets) computation.

use std::collections::{HashMap, HashSet};

use fabric_wire::EndpointId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("group {0} not found")]
    GroupNotFound(u64),
    #[error("group at capacity ({0} members)")]
    GroupFull(usize),
    #[error("unknown scenario {0:?}")]
    UnknownScenario(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    AllToAll,
    Pairs,
    Chain,
    Hub,
    Clear,
}

impl std::str::FromStr for Scenario {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all-to-all" => Ok(Scenario::AllToAll),
            "pairs" => Ok(Scenario::Pairs),
            "chain" => Ok(Scenario::Chain),
            "hub" => Ok(Scenario::Hub),
            "clear" => Ok(Scenario::Clear),
            other => Err(RoutingError::UnknownScenario(other.to_string())),
        }
    }
}

pub type GroupId = u64;

#[derive(Clone, Debug, Default, Serialize)]
pub struct RouteEntry {
    pub online: bool,
    pub muted: bool,
    pub broadcast: bool,
    pub routes: Vec<EndpointId>,
    pub groups: Vec<GroupId>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct RoutingConfig {
    pub routes: HashMap<String, Vec<String>>,
    pub broadcast: Vec<String>,
    pub muted: Vec<String>,
}

struct State {
    routes: HashMap<EndpointId, HashSet<EndpointId>>,
    broadcast: HashMap<EndpointId, bool>,
    muted: HashSet<EndpointId>,
    groups: HashMap<GroupId, HashSet<EndpointId>>,
    next_group_id: GroupId,
}

impl State {
    fn new() -> Self {
        Self {
            routes: HashMap::new(),
            broadcast: HashMap::new(),
            muted: HashSet::new(),
            groups: HashMap::new(),
            next_group_id: 1,
        }
    }

    fn group_co_members(&self, id: &EndpointId) -> HashSet<EndpointId> {
        let mut out = HashSet::new();
        for members in self.groups.values() {
            if members.contains(id) {
                out.extend(members.iter().copied().filter(|m| m != id));
            }
        }
        out
    }

    fn group_ids_containing(&self, id: &EndpointId) -> Vec<GroupId> {
        let mut out: Vec<GroupId> =
            self.groups.iter().filter(|(_, m)| m.contains(id)).map(|(g, _)| *g).collect();
        out.sort_unstable();
        out
    }
}

pub struct RoutingEngine {
    state: RwLock<State>,
    max_group_size: usize,
}

impl RoutingEngine {
    pub fn new(max_group_size: usize) -> Self {
        Self { state: RwLock::new(State::new()), max_group_size }
    }

    pub fn set_route(&self, src: EndpointId, tgt: EndpointId) {
        let mut s = self.state.write();
        s.routes.entry(src).or_default().insert(tgt);
    }

    pub fn remove_route(&self, src: EndpointId, tgt: EndpointId) {
        let mut s = self.state.write();
        if let Some(set) = s.routes.get_mut(&src) {
            set.remove(&tgt);
            if set.is_empty() {
                s.routes.remove(&src);
            }
        }
    }

    pub fn create_bidirectional(&self, a: EndpointId, b: EndpointId) {
        let mut s = self.state.write();
        s.routes.entry(a).or_default().insert(b);
        s.routes.entry(b).or_default().insert(a);
    }

    /// Replace `src`'s entire target set in one call.
    pub fn set_multiple_routes(&self, src: EndpointId, targets: impl IntoIterator<Item = EndpointId>) {
        let mut s = self.state.write();
        s.routes.insert(src, targets.into_iter().collect());
    }

    /// Remove every route with `src` as source.
    pub fn clear_routes(&self, src: EndpointId) {
        let mut s = self.state.write();
        s.routes.remove(&src);
    }

    /// Wire every id in `ids` to every other id in `ids`, replacing each
    /// member's existing target set. Fails if `ids` exceeds the configured
    /// group-size cap.
    pub fn create_conference(&self, ids: &[EndpointId]) -> Result<(), RoutingError> {
        if ids.len() > self.max_group_size {
            return Err(RoutingError::GroupFull(self.max_group_size));
        }
        let mut s = self.state.write();
        let members: HashSet<EndpointId> = ids.iter().copied().collect();
        for &member in ids {
            let targets: HashSet<EndpointId> = members.iter().copied().filter(|t| *t != member).collect();
            s.routes.insert(member, targets);
        }
        Ok(())
    }

    pub fn enable_broadcast(&self, src: EndpointId) {
        self.state.write().broadcast.insert(src, true);
    }

    pub fn disable_broadcast(&self, src: EndpointId) {
        self.state.write().broadcast.remove(&src);
    }

    pub fn mute(&self, id: EndpointId) {
        self.state.write().muted.insert(id);
    }

    pub fn unmute(&self, id: EndpointId) {
        self.state.write().muted.remove(&id);
    }

    pub fn is_muted(&self, id: &EndpointId) -> bool {
        self.state.read().muted.contains(id)
    }

    pub fn is_broadcast(&self, id: &EndpointId) -> bool {
        *self.state.read().broadcast.get(id).unwrap_or(&false)
    }

    /// Effective targets for audio originating at `src`, given the current
    /// online set. Rule order: muted source -> empty; broadcast source ->
    /// everyone online except self and muted; otherwise explicit routes
    /// union group co-members, minus muted.
    pub fn get_routes(&self, src: &EndpointId, online: &[EndpointId]) -> Vec<EndpointId> {
        let s = self.state.read();
        self.get_routes_locked(&s, src, online)
    }

    /// Full per-endpoint snapshot for the control plane (`RoutingMatrix`):
    /// every endpoint the routing engine has ever referenced, online or not.
    pub fn matrix(&self, online: &[EndpointId]) -> HashMap<EndpointId, RouteEntry> {
        let s = self.state.read();
        let online_set: HashSet<EndpointId> = online.iter().copied().collect();
        let all_ids: HashSet<EndpointId> = online_set
            .iter()
            .copied()
            .chain(s.routes.keys().copied())
            .chain(s.broadcast.keys().copied())
            .chain(s.muted.iter().copied())
            .chain(s.groups.values().flatten().copied())
            .collect();

        let mut out = HashMap::with_capacity(all_ids.len());
        for id in all_ids {
            let routes = self.get_routes_locked(&s, &id, online);
            out.insert(
                id,
                RouteEntry {
                    online: online_set.contains(&id),
                    muted: s.muted.contains(&id),
                    broadcast: *s.broadcast.get(&id).unwrap_or(&false),
                    routes,
                    groups: s.group_ids_containing(&id),
                },
            );
        }
        out
    }

    fn get_routes_locked(&self, s: &State, src: &EndpointId, online: &[EndpointId]) -> Vec<EndpointId> {
        if s.muted.contains(src) {
            return Vec::new();
        }
        if *s.broadcast.get(src).unwrap_or(&false) {
            return online.iter().filter(|id| *id != src && !s.muted.contains(*id)).copied().collect();
        }
        let mut targets: HashSet<EndpointId> = s.routes.get(src).cloned().unwrap_or_default();
        targets.extend(s.group_co_members(src));
        targets.retain(|t| !s.muted.contains(t));
        targets.into_iter().collect()
    }

    fn scenario_all_to_all(&self, s: &mut State, online: &[EndpointId]) {
        for &a in online {
            let entry = s.routes.entry(a).or_default();
            entry.extend(online.iter().copied().filter(|b| *b != a));
        }
    }

    fn scenario_pairs(&self, s: &mut State, online: &[EndpointId]) {
        for pair in online.chunks(2) {
            if let [a, b] = pair {
                s.routes.entry(*a).or_default().insert(*b);
                s.routes.entry(*b).or_default().insert(*a);
            }
        }
    }

    fn scenario_chain(&self, s: &mut State, online: &[EndpointId]) {
        for w in online.windows(2) {
            s.routes.entry(w[0]).or_default().insert(w[1]);
            s.routes.entry(w[1]).or_default().insert(w[0]);
        }
    }

    fn scenario_hub(&self, s: &mut State, online: &[EndpointId]) {
        if let Some((hub, rest)) = online.split_first() {
            for &other in rest {
                s.routes.entry(*hub).or_default().insert(other);
                s.routes.entry(other).or_default().insert(*hub);
            }
        }
    }

    /// Apply a scenario preset over the current online set. `clear` wipes
    /// routes/broadcast/muted; groups are left untouched (a scenario preset
    /// governs the routing matrix, not conference membership).
    pub fn apply_scenario(&self, scenario: Scenario, online: &[EndpointId]) {
        let mut s = self.state.write();
        s.routes.clear();
        s.broadcast.clear();
        s.muted.clear();
        match scenario {
            Scenario::Clear => {}
            Scenario::AllToAll => self.scenario_all_to_all(&mut s, online),
            Scenario::Pairs => self.scenario_pairs(&mut s, online),
            Scenario::Chain => self.scenario_chain(&mut s, online),
            Scenario::Hub => self.scenario_hub(&mut s, online),
        }
    }

    pub fn create_group(&self) -> GroupId {
        let mut s = self.state.write();
        let id = s.next_group_id;
        s.next_group_id += 1;
        s.groups.insert(id, HashSet::new());
        id
    }

    pub fn delete_group(&self, group: GroupId) -> Result<(), RoutingError> {
        let mut s = self.state.write();
        s.groups.remove(&group).ok_or(RoutingError::GroupNotFound(group)).map(|_| ())
    }

    pub fn add_member(&self, group: GroupId, id: EndpointId) -> Result<(), RoutingError> {
        let mut s = self.state.write();
        let max = self.max_group_size;
        let members = s.groups.get_mut(&group).ok_or(RoutingError::GroupNotFound(group))?;
        if members.len() >= max {
            return Err(RoutingError::GroupFull(max));
        }
        members.insert(id);
        Ok(())
    }

    pub fn remove_member(&self, group: GroupId, id: EndpointId) -> Result<(), RoutingError> {
        let mut s = self.state.write();
        let members = s.groups.get_mut(&group).ok_or(RoutingError::GroupNotFound(group))?;
        members.remove(&id);
        Ok(())
    }

    pub fn group_ids_containing(&self, id: &EndpointId) -> Vec<GroupId> {
        self.state.read().group_ids_containing(id)
    }

    /// Export the current routing configuration for persistence/transfer.
    pub fn export_config(&self) -> RoutingConfig {
        let s = self.state.read();
        RoutingConfig {
            routes: s
                .routes
                .iter()
                .map(|(src, tgts)| {
                    (src.as_str().into_owned(), tgts.iter().map(|t| t.as_str().into_owned()).collect())
                })
                .collect(),
            broadcast: s.broadcast.iter().filter(|(_, v)| **v).map(|(id, _)| id.as_str().into_owned()).collect(),
            muted: s.muted.iter().map(|id| id.as_str().into_owned()).collect(),
        }
    }

    /// Import a routing configuration. Transactional in the narrow sense
    /// that the existing state is cleared first; if a malformed id is
    /// encountered mid-import the routing table is left whatever-partial-
    /// state it reached rather than rolled back (see design notes — the
    /// control plane is expected to validate ids before calling this).
    pub fn import_config(&self, cfg: &RoutingConfig) -> Result<(), fabric_wire::WireError> {
        let mut s = self.state.write();
        s.routes.clear();
        s.broadcast.clear();
        s.muted.clear();

        for (src, tgts) in &cfg.routes {
            let src_id = EndpointId::new(src)?;
            let mut set = HashSet::with_capacity(tgts.len());
            for t in tgts {
                set.insert(EndpointId::new(t)?);
            }
            s.routes.insert(src_id, set);
        }
        for b in &cfg.broadcast {
            s.broadcast.insert(EndpointId::new(b)?, true);
        }
        for m in &cfg.muted {
            s.muted.insert(EndpointId::new(m)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EndpointId {
        EndpointId::new(s).unwrap()
    }

    #[test]
    fn explicit_route_is_effective_target() {
        let r = RoutingEngine::new(16);
        r.set_route(id("001"), id("002"));
        let online = [id("001"), id("002")];
        assert_eq!(r.get_routes(&id("001"), &online), vec![id("002")]);
        assert!(r.get_routes(&id("002"), &online).is_empty());
    }

    #[test]
    fn muted_source_has_empty_targets() {
        let r = RoutingEngine::new(16);
        r.set_route(id("001"), id("002"));
        r.mute(id("001"));
        let online = [id("001"), id("002")];
        assert!(r.get_routes(&id("001"), &online).is_empty());
    }

    #[test]
    fn muted_destination_excluded() {
        let r = RoutingEngine::new(16);
        r.set_route(id("001"), id("002"));
        r.set_route(id("001"), id("003"));
        r.mute(id("002"));
        let online = [id("001"), id("002"), id("003")];
        assert_eq!(r.get_routes(&id("001"), &online), vec![id("003")]);
    }

    #[test]
    fn broadcast_targets_everyone_online_except_self_and_muted() {
        let r = RoutingEngine::new(16);
        r.enable_broadcast(id("001"));
        r.mute(id("003"));
        let online = [id("001"), id("002"), id("003")];
        let mut targets = r.get_routes(&id("001"), &online);
        targets.sort_by_key(|id| id.to_string());
        assert_eq!(targets, vec![id("002")]);
    }

    #[test]
    fn group_membership_gives_implicit_bidirectional_routing() {
        let r = RoutingEngine::new(16);
        let g = r.create_group();
        r.add_member(g, id("001")).unwrap();
        r.add_member(g, id("002")).unwrap();
        r.add_member(g, id("003")).unwrap();
        let online = [id("001"), id("002"), id("003")];
        let mut targets = r.get_routes(&id("001"), &online);
        targets.sort_by_key(|id| id.to_string());
        assert_eq!(targets, vec![id("002"), id("003")]);
    }

    #[test]
    fn group_add_member_respects_capacity() {
        let r = RoutingEngine::new(1);
        let g = r.create_group();
        r.add_member(g, id("001")).unwrap();
        assert_eq!(r.add_member(g, id("002")), Err(RoutingError::GroupFull(1)));
    }

    #[test]
    fn scenario_hub_connects_first_to_rest() {
        let r = RoutingEngine::new(16);
        let online = [id("001"), id("002"), id("003")];
        r.apply_scenario(Scenario::Hub, &online);
        assert_eq!(r.get_routes(&id("001"), &online).len(), 2);
        assert_eq!(r.get_routes(&id("002"), &online), vec![id("001")]);
    }

    #[test]
    fn scenario_chain_links_consecutive_pairs() {
        let r = RoutingEngine::new(16);
        let online = [id("001"), id("002"), id("003")];
        r.apply_scenario(Scenario::Chain, &online);
        let mut mid = r.get_routes(&id("002"), &online);
        mid.sort_by_key(|id| id.to_string());
        assert_eq!(mid, vec![id("001"), id("003")]);
    }

    #[test]
    fn scenario_clear_wipes_everything() {
        let r = RoutingEngine::new(16);
        let online = [id("001"), id("002")];
        r.apply_scenario(Scenario::AllToAll, &online);
        r.apply_scenario(Scenario::Clear, &online);
        assert!(r.get_routes(&id("001"), &online).is_empty());
        assert!(!r.is_broadcast(&id("001")));
    }

    #[test]
    fn export_then_import_round_trips() {
        let r = RoutingEngine::new(16);
        r.set_route(id("001"), id("002"));
        r.enable_broadcast(id("003"));
        r.mute(id("004"));
        let cfg = r.export_config();

        let r2 = RoutingEngine::new(16);
        r2.import_config(&cfg).unwrap();
        let online = [id("001"), id("002"), id("003"), id("004")];
        assert_eq!(r2.get_routes(&id("001"), &online), vec![id("002")]);
        assert!(r2.is_broadcast(&id("003")));
        assert!(r2.is_muted(&id("004")));
    }

    #[test]
    fn scenario_unknown_string_is_rejected() {
        assert_eq!("bogus".parse::<Scenario>(), Err(RoutingError::UnknownScenario("bogus".to_string())));
    }

    #[test]
    fn remove_route_deletes_the_entry_once_empty() {
        let r = RoutingEngine::new(16);
        r.set_route(id("001"), id("002"));
        r.remove_route(id("001"), id("002"));
        let online = [id("001"), id("002")];
        assert!(r.get_routes(&id("001"), &online).is_empty());
        // Confirmed via export: a deleted entry shouldn't reappear as an
        // empty target list.
        assert!(!r.export_config().routes.contains_key("001"));
    }

    #[test]
    fn set_multiple_routes_replaces_existing_targets() {
        let r = RoutingEngine::new(16);
        r.set_route(id("001"), id("999"));
        r.set_multiple_routes(id("001"), vec![id("002"), id("003")]);
        let online = [id("001"), id("002"), id("003"), id("999")];
        let mut targets = r.get_routes(&id("001"), &online);
        targets.sort_by_key(|id| id.to_string());
        assert_eq!(targets, vec![id("002"), id("003")]);
    }

    #[test]
    fn clear_routes_deletes_the_entry() {
        let r = RoutingEngine::new(16);
        r.set_route(id("001"), id("002"));
        r.clear_routes(id("001"));
        let online = [id("001"), id("002")];
        assert!(r.get_routes(&id("001"), &online).is_empty());
        assert!(!r.export_config().routes.contains_key("001"));
    }

    #[test]
    fn create_conference_links_everyone_to_everyone_else() {
        let r = RoutingEngine::new(16);
        let ids = vec![id("001"), id("002"), id("003")];
        r.create_conference(&ids).unwrap();
        let online = [id("001"), id("002"), id("003")];
        let mut targets = r.get_routes(&id("001"), &online);
        targets.sort_by_key(|id| id.to_string());
        assert_eq!(targets, vec![id("002"), id("003")]);
    }

    #[test]
    fn create_conference_rejects_oversized_group() {
        let r = RoutingEngine::new(2);
        let ids = vec![id("001"), id("002"), id("003")];
        assert_eq!(r.create_conference(&ids), Err(RoutingError::GroupFull(2)));
    }
}
