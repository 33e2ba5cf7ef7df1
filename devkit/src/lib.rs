/*!
# LoadGrid DevKit - Nœuds simulés et utilitaires de test

Bibliothèque facilitant les tests du coordinateur LoadGrid avec:
- Nœuds HTTP simulés (sain, en échec, bloqué, lent au premier appel, éteint) sur ports éphémères
- Builders pour les corps de requêtes de niveaux
- Harness de test regroupant une flotte de nœuds simulés
*/

pub mod mock_node;
pub mod levels;
pub mod test_utils;

pub use mock_node::{MockNode, NodeBehavior, ReceivedRequest};
pub use levels::{FleetLevels, LevelsBuilder};
pub use test_utils::TestHarness;
