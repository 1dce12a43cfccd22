/*!
# Symbion DevKit - Doubles de test pour fleet-sync

Bibliothèque facilitant les tests du moteur de synchronisation avec:
- Transport mock pour tests sans serveur WebSocket
- Source historique mock (réponses scriptées, différées)
- Builders de messages push et d'échantillons
- Harness montant un moteur complet sur ces doubles
*/

pub mod builders;
pub mod mock_history;
pub mod mock_transport;
pub mod test_utils;

pub use builders::{FleetMessageBuilder, SampleBuilder};
pub use mock_history::{DeferredReply, MockHistory};
pub use mock_transport::{ConnectOutcome, MockTransport};
pub use test_utils::{TestHarness, HARNESS_NOW_MS};
