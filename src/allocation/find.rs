/*
 * Copyright 2024 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use rand::{seq::SliceRandom, Rng};

use crate::{
    crd::{GameServer, GameServerAllocation, SchedulingStrategy},
    nodes::NodeCounter,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("no Ready GameServer matched the allocation selectors")]
pub struct NoGameServerReady;

/// Whether `labels` satisfies a Kubernetes label selector. An empty selector
/// matches everything.
pub fn selector_matches(
    selector: &LabelSelector,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    static EMPTY: BTreeMap<String, String> = BTreeMap::new();
    let labels = labels.unwrap_or(&EMPTY);

    if let Some(required) = &selector.match_labels {
        if !required.iter().all(|(k, v)| labels.get(k) == Some(v)) {
            return false;
        }
    }

    for expr in selector.match_expressions.as_deref().unwrap_or_default() {
        let value = labels.get(&expr.key);
        let values = expr.values.as_deref().unwrap_or_default();
        let matched = match expr.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => !value.is_some_and(|v| values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        };
        if !matched {
            return false;
        }
    }

    true
}

/// Order the ready list for Packed allocation: servers on nodes carrying the
/// most allocated sessions first, so allocations concentrate on busy nodes
/// and empty ones can be reclaimed. Ties break on node name, then server
/// name, keeping selection deterministic.
pub fn sort_for_packed(servers: &mut [GameServer], counter: &NodeCounter) {
    servers.sort_by(|a, b| {
        let node_a = a.status.as_ref().map(|s| s.node_name.as_str()).unwrap_or_default();
        let node_b = b.status.as_ref().map(|s| s.node_name.as_str()).unwrap_or_default();
        counter
            .allocated(node_b)
            .cmp(&counter.allocated(node_a))
            .then_with(|| node_a.cmp(node_b))
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
}

/// Find the optimal server for `gsa` in `list`, returning its index so the
/// caller can remove it. Preferred selectors win in declaration order over a
/// plain required match. Packed walks the (sorted) list front to back;
/// Distributed walks it in random order. When `top_n > 1`, the chosen
/// required match is sampled uniformly from the best `top_n` candidates to
/// spread contention under concurrent bursts.
pub fn find_game_server_for_allocation(
    gsa: &GameServerAllocation,
    list: &[GameServer],
    top_n: usize,
) -> Result<usize, NoGameServerReady> {
    let indices: Vec<usize> = match gsa.spec.scheduling {
        SchedulingStrategy::Packed => (0..list.len()).collect(),
        SchedulingStrategy::Distributed => {
            let mut indices: Vec<usize> = (0..list.len()).collect();
            indices.shuffle(&mut rand::thread_rng());
            indices
        }
    };

    let mut preferred: Vec<Option<usize>> = vec![None; gsa.spec.preferred.len()];
    let mut required: Vec<usize> = Vec::with_capacity(top_n.max(1));

    for index in indices {
        let gs = &list[index];
        if gs.metadata.namespace != gsa.metadata.namespace {
            continue;
        }
        let labels = gs.metadata.labels.as_ref();

        for (slot, selector) in preferred.iter_mut().zip(&gsa.spec.preferred) {
            if slot.is_none() && selector_matches(selector, labels) {
                *slot = Some(index);
            }
        }

        if required.len() < top_n.max(1) && selector_matches(&gsa.spec.required, labels) {
            required.push(index);
        }
    }

    if let Some(index) = preferred.into_iter().flatten().next() {
        return Ok(index);
    }

    match required.as_slice() {
        [] => Err(NoGameServerReady),
        [only] => Ok(*only),
        candidates => Ok(candidates[rand::thread_rng().gen_range(0..candidates.len())]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        allocation::GameServerAllocationSpec,
        game_server::{GameServerState, GameServerStatus},
    };

    fn ready(name: &str, node: &str, labels: &[(&str, &str)]) -> GameServer {
        let mut gs = GameServer::new(name, Default::default());
        gs.metadata.namespace = Some("default".into());
        gs.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        gs.status = Some(GameServerStatus {
            state: Some(GameServerState::Ready),
            node_name: node.into(),
            ..Default::default()
        });
        gs
    }

    fn allocation(required: &[(&str, &str)], preferred: Vec<Vec<(&str, &str)>>) -> GameServerAllocation {
        fn selector(labels: &[(&str, &str)]) -> LabelSelector {
            LabelSelector {
                match_labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                match_expressions: None,
            }
        }

        let mut gsa = GameServerAllocation::new(
            "alloc",
            GameServerAllocationSpec {
                required: selector(required),
                preferred: preferred.iter().map(|p| selector(p)).collect(),
                ..Default::default()
            },
        );
        gsa.metadata.namespace = Some("default".into());
        gsa
    }

    #[test]
    fn selector_semantics() {
        let labels: BTreeMap<String, String> =
            [("fleet".to_owned(), "simple".to_owned())].into();

        assert!(selector_matches(&LabelSelector::default(), Some(&labels)));

        let selector = LabelSelector {
            match_labels: Some([("fleet".to_owned(), "simple".to_owned())].into()),
            ..Default::default()
        };
        assert!(selector_matches(&selector, Some(&labels)));
        assert!(!selector_matches(&selector, None));

        use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
        let exprs = |op: &str, values: Option<Vec<&str>>| LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "fleet".into(),
                operator: op.into(),
                values: values.map(|v| v.into_iter().map(String::from).collect()),
            }]),
            ..Default::default()
        };
        assert!(selector_matches(&exprs("In", Some(vec!["simple"])), Some(&labels)));
        assert!(!selector_matches(&exprs("NotIn", Some(vec!["simple"])), Some(&labels)));
        // NotIn matches when the key is absent entirely
        assert!(selector_matches(&exprs("NotIn", Some(vec!["simple"])), None));
        assert!(selector_matches(&exprs("Exists", None), Some(&labels)));
        assert!(!selector_matches(&exprs("DoesNotExist", None), Some(&labels)));
    }

    #[test]
    fn required_takes_first_in_packed_order() {
        let list = vec![
            ready("gs1", "node-a", &[("fleet", "simple")]),
            ready("gs2", "node-a", &[("fleet", "simple")]),
        ];
        let gsa = allocation(&[("fleet", "simple")], vec![]);
        assert_eq!(find_game_server_for_allocation(&gsa, &list, 1), Ok(0));
    }

    #[test]
    fn preferred_wins_over_required_in_declaration_order() {
        let list = vec![
            ready("gs1", "node-a", &[("fleet", "simple")]),
            ready("gs2", "node-a", &[("fleet", "simple"), ("map", "dunes")]),
            ready("gs3", "node-a", &[("fleet", "simple"), ("map", "cliffs")]),
        ];
        let gsa = allocation(
            &[("fleet", "simple")],
            vec![vec![("map", "cliffs")], vec![("map", "dunes")]],
        );
        // both preferred selectors match somewhere; the first declared wins
        assert_eq!(find_game_server_for_allocation(&gsa, &list, 1), Ok(2));
    }

    #[test]
    fn falls_back_to_required_when_no_preferred_matches() {
        let list = vec![ready("gs1", "node-a", &[("fleet", "simple")])];
        let gsa = allocation(&[("fleet", "simple")], vec![vec![("map", "dunes")]]);
        assert_eq!(find_game_server_for_allocation(&gsa, &list, 1), Ok(0));
    }

    #[test]
    fn empty_list_is_unallocated() {
        let gsa = allocation(&[("fleet", "simple")], vec![]);
        assert_eq!(
            find_game_server_for_allocation(&gsa, &[], 1),
            Err(NoGameServerReady)
        );
    }

    #[test]
    fn other_namespaces_never_match() {
        let mut gs = ready("gs1", "node-a", &[("fleet", "simple")]);
        gs.metadata.namespace = Some("other".into());
        let gsa = allocation(&[("fleet", "simple")], vec![]);
        assert_eq!(
            find_game_server_for_allocation(&gsa, &[gs], 1),
            Err(NoGameServerReady)
        );
    }

    #[test]
    fn top_n_samples_from_best_candidates() {
        let list: Vec<GameServer> = (0..10)
            .map(|i| ready(&format!("gs{i}"), "node-a", &[("fleet", "simple")]))
            .collect();
        let gsa = allocation(&[("fleet", "simple")], vec![]);
        for _ in 0..50 {
            let index = find_game_server_for_allocation(&gsa, &list, 3).unwrap();
            assert!(index < 3, "candidate {index} outside the top 3");
        }
    }

    #[test]
    fn distributed_still_finds_a_match() {
        let list = vec![
            ready("gs1", "node-a", &[("fleet", "simple")]),
            ready("gs2", "node-b", &[("fleet", "other")]),
        ];
        let mut gsa = allocation(&[("fleet", "simple")], vec![]);
        gsa.spec.scheduling = SchedulingStrategy::Distributed;
        for _ in 0..20 {
            assert_eq!(find_game_server_for_allocation(&gsa, &list, 1), Ok(0));
        }
    }

    #[test]
    fn packed_sort_concentrates_on_busy_nodes() {
        let counter = NodeCounter::new();
        let allocated = {
            let mut gs = ready("busy", "node-b", &[]);
            gs.status.as_mut().unwrap().state = Some(GameServerState::Allocated);
            gs
        };
        counter.observe(&crate::watch::Event::Apply(allocated));

        let mut list = vec![
            ready("gs1", "node-a", &[]),
            ready("gs2", "node-b", &[]),
            ready("gs0", "node-a", &[]),
        ];
        sort_for_packed(&mut list, &counter);

        let names: Vec<&str> = list
            .iter()
            .map(|gs| gs.metadata.name.as_deref().unwrap())
            .collect();
        // node-b holds an allocation, so its server sorts first; node-a ties
        // break on server name
        assert_eq!(names, vec!["gs2", "gs0", "gs1"]);
    }
}
