/**
 * SNAPSHOT CANONIQUE - Derniers niveaux demandés par nœud
 *
 * RÔLE :
 * Source de vérité de « ce qui a été demandé », indépendante du succès de la propagation.
 * Mis à jour de façon synchrone à chaque requête acceptée ; une propagation échouée ne
 * l'annule jamais.
 *
 * CONCURRENCE : un seul RwLock, chaque fusion est atomique (un écrivain à la fois).
 * Chaque fusion ou reset incrémente la révision du nœud : le pool de propagation s'en sert
 * pour ne jamais pousser un vecteur plus ancien que le dernier envoyé.
 */

use loadgrid_contracts::{IntensityVector, ResourceProfile};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Vecteur complet d'un nœud et son numéro de révision
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub levels: IntensityVector,
    pub number: u64,
}

#[derive(Default)]
struct Entry {
    levels: IntensityVector,
    revision: u64,
}

pub struct CanonicalSnapshot {
    profile: ResourceProfile,
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl CanonicalSnapshot {
    /// Chaque nœud démarre à zéro sur toutes les clés du profil
    pub fn new<'a>(profile: ResourceProfile, nodes: impl IntoIterator<Item = &'a str>) -> Self {
        let entries = nodes
            .into_iter()
            .map(|n| (n.to_string(), Entry { levels: IntensityVector::zeroed(profile), revision: 0 }))
            .collect();
        Self { profile, entries: RwLock::new(entries) }
    }

    /// Fusion partielle, renvoie le vecteur complet résultant
    pub fn merge(&self, node: &str, partial: &IntensityVector) -> Revision {
        let mut entries = self.entries.write();
        let entry = self.entry(&mut entries, node);
        entry.levels.merge(partial);
        entry.revision += 1;
        Revision { levels: entry.levels.clone(), number: entry.revision }
    }

    pub fn reset(&self, node: &str) -> Revision {
        let mut entries = self.entries.write();
        let entry = self.entry(&mut entries, node);
        entry.levels = IntensityVector::zeroed(self.profile);
        entry.revision += 1;
        Revision { levels: entry.levels.clone(), number: entry.revision }
    }

    pub fn get(&self, node: &str) -> Option<IntensityVector> {
        self.entries.read().get(node).map(|e| e.levels.clone())
    }

    pub fn all(&self) -> BTreeMap<String, IntensityVector> {
        self.entries
            .read()
            .iter()
            .map(|(node, e)| (node.clone(), e.levels.clone()))
            .collect()
    }

    fn entry<'a>(&self, entries: &'a mut BTreeMap<String, Entry>, node: &str) -> &'a mut Entry {
        entries.entry(node.to_string()).or_insert_with(|| Entry {
            levels: IntensityVector::zeroed(self.profile),
            revision: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadgrid_contracts::ResourceKey;

    #[test]
    fn test_merge_keeps_previous_values() {
        let snapshot = CanonicalSnapshot::new(ResourceProfile::Business, ["inventory_system"]);
        snapshot.merge("inventory_system", &IntensityVector::new().with(ResourceKey::Storage, 30));
        let merged = snapshot
            .merge("inventory_system", &IntensityVector::new().with(ResourceKey::Processing, 80))
            .levels;

        assert_eq!(merged.get(ResourceKey::Processing), 80);
        assert_eq!(merged.get(ResourceKey::Storage), 30);
        assert_eq!(merged.len(), 5);
        assert_eq!(snapshot.get("inventory_system"), Some(merged));
    }

    #[test]
    fn test_revisions_increase_per_node() {
        let snapshot = CanonicalSnapshot::new(ResourceProfile::Business, ["inventory_system", "user_management"]);
        let first = snapshot.merge("inventory_system", &IntensityVector::new().with(ResourceKey::Storage, 30));
        let other = snapshot.merge("user_management", &IntensityVector::new().with(ResourceKey::Storage, 30));
        let reset = snapshot.reset("inventory_system");
        let last = snapshot.merge("inventory_system", &IntensityVector::new());

        assert_eq!(first.number, 1);
        assert_eq!(other.number, 1);
        assert_eq!(reset.number, 2);
        assert_eq!(last.number, 3);
        assert!(last.levels.is_idle());
    }

    #[test]
    fn test_reset_zeroes_one_node() {
        let snapshot = CanonicalSnapshot::new(ResourceProfile::Legacy, ["cpu_worker", "memory_worker"]);
        snapshot.merge("cpu_worker", &IntensityVector::new().with(ResourceKey::Cpu, 60));
        snapshot.merge("memory_worker", &IntensityVector::new().with(ResourceKey::Memory, 40));

        assert!(snapshot.reset("cpu_worker").levels.is_idle());
        let all = snapshot.all();
        assert!(all["cpu_worker"].is_idle());
        assert_eq!(all["memory_worker"].get(ResourceKey::Memory), 40);
    }
}
