/**
 * CLIENT NŒUDS - Appels HTTP sortants vers les agents
 *
 * RÔLE :
 * Pousse niveaux / reset / bascule running vers un nœud et interroge son /health et son
 * /metrics. Chaque appel est borné par `tokio::time::timeout` ; l'échec d'un nœud n'est
 * qu'une valeur d'erreur, jamais une panique ni un blocage des autres.
 */

use loadgrid_contracts::{IntensityVector, LevelsAck, NodeMetrics, RunningToggle};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Échec d'un appel vers un nœud
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropagationError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("node answered HTTP {0}")]
    Status(u16),
    #[error("unreadable node response: {0}")]
    Decode(String),
    #[error("superseded by a newer update")]
    Superseded,
}

impl PropagationError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            PropagationError::Status(code) => Some(*code),
            _ => None,
        }
    }
}

/// Commande poussée vers un nœud
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    Levels(IntensityVector),
    Reset,
    Running(bool),
}

impl NodeCommand {
    pub fn describe(&self) -> String {
        match self {
            NodeCommand::Levels(levels) => format!("levels {:?}", levels),
            NodeCommand::Reset => "reset".to_string(),
            NodeCommand::Running(on) => format!("running={}", on),
        }
    }
}

#[derive(Clone)]
pub struct NodeClient {
    http: reqwest::Client,
}

impl NodeClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("loadgrid-kernel/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    pub async fn send(&self, url: &str, command: &NodeCommand, limit: Duration) -> Result<LevelsAck, PropagationError> {
        let request = match command {
            NodeCommand::Levels(levels) => self.http.post(format!("{}/resources", url)).json(levels),
            NodeCommand::Reset => self.http.post(format!("{}/resources/reset", url)),
            NodeCommand::Running(on) => self
                .http
                .post(format!("{}/system/running", url))
                .json(&RunningToggle { is_running: *on }),
        };
        self.call(request, limit).await
    }

    /// `GET /health` : code HTTP renvoyé, quel qu'il soit
    pub async fn health(&self, url: &str, limit: Duration) -> Result<u16, PropagationError> {
        let request = self.http.get(format!("{}/health", url));
        tokio::time::timeout(limit, async {
            request.send().await.map(|r| r.status().as_u16()).map_err(transport)
        })
        .await
        .map_err(|_| PropagationError::Timeout(limit))?
    }

    pub async fn metrics(&self, url: &str, limit: Duration) -> Result<NodeMetrics, PropagationError> {
        self.call(self.http.get(format!("{}/metrics", url)), limit).await
    }

    async fn call<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder, limit: Duration) -> Result<T, PropagationError> {
        tokio::time::timeout(limit, async {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => return Err(transport(e)),
            };
            if !response.status().is_success() {
                return Err(PropagationError::Status(response.status().as_u16()));
            }
            response
                .json::<T>()
                .await
                .map_err(|e| PropagationError::Decode(e.to_string()))
        })
        .await
        .map_err(|_| PropagationError::Timeout(limit))?
    }
}

fn transport(e: reqwest::Error) -> PropagationError {
    PropagationError::Transport(e.to_string())
}
