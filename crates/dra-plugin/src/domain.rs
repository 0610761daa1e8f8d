//! Compute domain membership ledger.
//!
//! Domains are stored in the checkpoint next to the prepared claims and
//! referenced from there only by ID. The aggregator never decides whether a
//! domain is ready, it only records which nodes, pods and claims belong to it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainInfo {
    #[serde(rename = "domainID")]
    pub domain_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub nodes: BTreeSet<String>,
    #[serde(default)]
    pub pods: BTreeSet<PodRef>,
    #[serde(default)]
    pub claims: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl DomainInfo {
    fn new(domain_id: &str) -> Self {
        Self {
            domain_id: domain_id.to_string(),
            name: domain_id.to_string(),
            uid: domain_id.to_string(),
            nodes: BTreeSet::new(),
            pods: BTreeSet::new(),
            claims: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_unreferenced(&self) -> bool {
        self.claims.is_empty() && self.pods.is_empty()
    }
}

/// Mutating view over the `domains` map of a checkpoint.
pub struct DomainAggregator<'a> {
    domains: &'a mut BTreeMap<String, DomainInfo>,
}

impl<'a> DomainAggregator<'a> {
    pub fn new(domains: &'a mut BTreeMap<String, DomainInfo>) -> Self {
        Self { domains }
    }

    /// Records that `claim_uid` on `node_name` is a member of the domain,
    /// creating the domain on first reference.
    pub fn attach_claim(&mut self, domain_id: &str, claim_uid: &str, node_name: &str) {
        let domain = self
            .domains
            .entry(domain_id.to_string())
            .or_insert_with(|| {
                info!(domain_id, "Creating compute domain");
                DomainInfo::new(domain_id)
            });
        domain.claims.insert(claim_uid.to_string());
        domain.nodes.insert(node_name.to_string());
        debug!(
            domain_id,
            claim_uid,
            node_name,
            nodes = domain.nodes.len(),
            "Attached claim to compute domain"
        );
    }

    /// Returns `true` if the domain was deleted as a result.
    pub fn detach_claim(&mut self, domain_id: &str, claim_uid: &str) -> bool {
        let Some(domain) = self.domains.get_mut(domain_id) else {
            return false;
        };
        domain.claims.remove(claim_uid);
        self.remove_if_unreferenced(domain_id)
    }

    /// Detaches the claim from every domain that lists it.
    pub fn detach_claim_everywhere(&mut self, claim_uid: &str) {
        let owners: Vec<String> = self
            .domains
            .iter()
            .filter(|(_, domain)| domain.claims.contains(claim_uid))
            .map(|(id, _)| id.clone())
            .collect();
        for domain_id in owners {
            self.detach_claim(&domain_id, claim_uid);
        }
    }

    /// Adds a pod to an existing domain. Unknown domains are ignored and
    /// `false` is returned.
    pub fn attach_pod(&mut self, domain_id: &str, pod: PodRef) -> bool {
        match self.domains.get_mut(domain_id) {
            Some(domain) => {
                domain.pods.insert(pod);
                true
            }
            None => false,
        }
    }

    pub fn detach_pod(&mut self, domain_id: &str, pod: &PodRef) -> bool {
        let Some(domain) = self.domains.get_mut(domain_id) else {
            return false;
        };
        domain.pods.remove(pod);
        self.remove_if_unreferenced(domain_id)
    }

    fn remove_if_unreferenced(&mut self, domain_id: &str) -> bool {
        let unreferenced = self
            .domains
            .get(domain_id)
            .is_some_and(DomainInfo::is_unreferenced);
        if unreferenced {
            self.domains.remove(domain_id);
            info!(domain_id, "Deleted compute domain with no claims or pods");
        }
        unreferenced
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test]
    fn two_nodes_share_one_domain() {
        let mut domains = BTreeMap::new();
        let mut aggregator = DomainAggregator::new(&mut domains);

        aggregator.attach_claim("d1", "claim-a", "node-a");
        aggregator.attach_claim("d1", "claim-b", "node-b");

        assert_eq!(domains.len(), 1);
        let domain = &domains["d1"];
        assert_eq!(domain.nodes.len(), 2);
        assert_eq!(domain.claims.len(), 2);
    }

    #[test]
    fn detaching_last_claim_deletes_domain() {
        let mut domains = BTreeMap::new();
        let mut aggregator = DomainAggregator::new(&mut domains);
        aggregator.attach_claim("d1", "claim-a", "node-a");
        aggregator.attach_claim("d1", "claim-b", "node-b");

        assert!(!aggregator.detach_claim("d1", "claim-a"));
        assert!(aggregator.detach_claim("d1", "claim-b"));
        assert!(domains.is_empty());
    }

    #[test]
    fn repeated_attach_keeps_set_semantics() {
        let mut domains = BTreeMap::new();
        let mut aggregator = DomainAggregator::new(&mut domains);
        aggregator.attach_claim("d1", "claim-a", "node-a");
        aggregator.attach_claim("d1", "claim-a", "node-a");

        assert_eq!(domains["d1"].claims.len(), 1);
        assert_eq!(domains["d1"].nodes.len(), 1);
    }

    #[test]
    fn pods_keep_domain_alive() {
        let mut domains = BTreeMap::new();
        let mut aggregator = DomainAggregator::new(&mut domains);
        let pod = PodRef {
            namespace: "default".to_string(),
            name: "worker-0".to_string(),
        };

        aggregator.attach_claim("d1", "claim-a", "node-a");
        assert!(aggregator.attach_pod("d1", pod.clone()));
        assert!(!aggregator.detach_claim("d1", "claim-a"));
        assert!(domains.contains_key("d1"));

        let mut aggregator = DomainAggregator::new(&mut domains);
        assert!(aggregator.detach_pod("d1", &pod));
        assert!(domains.is_empty());
    }

    #[test]
    fn pods_are_not_attached_to_unknown_domains() {
        let mut domains = BTreeMap::new();
        let mut aggregator = DomainAggregator::new(&mut domains);
        let pod = PodRef {
            namespace: "default".to_string(),
            name: "worker-0".to_string(),
        };
        assert!(!aggregator.attach_pod("missing", pod));
        assert!(domains.is_empty());
    }

    #[test]
    fn detach_everywhere_only_touches_owning_domains() {
        let mut domains = BTreeMap::new();
        let mut aggregator = DomainAggregator::new(&mut domains);
        aggregator.attach_claim("d1", "claim-a", "node-a");
        aggregator.attach_claim("d2", "claim-b", "node-a");

        aggregator.detach_claim_everywhere("claim-a");
        assert_eq!(domains.keys().collect::<Vec<_>>(), vec!["d2"]);
    }

    #[test]
    fn domain_info_wire_format() {
        let mut domains = BTreeMap::new();
        DomainAggregator::new(&mut domains).attach_claim("d1", "claim-a", "node-a");
        let json = serde_json::to_value(&domains["d1"]).expect("serialize");
        assert_eq!(json["domainID"], "d1");
        assert!(json.get("createdAt").is_some());
    }
}
