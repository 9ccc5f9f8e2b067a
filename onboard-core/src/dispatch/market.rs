use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{CounterpartyId, DealOutcome, Piece};
use crate::error::DispatchError;

/// Eligibility pool and deal proposals.
///
/// `propose_deal` answers `Accepted` or `Rejected`; transport errors are
/// returned as errors and counted as expired attempts by the caller.
#[async_trait]
pub trait DealMarket: Send + Sync {
    async fn list_eligible(
        &self,
        piece: &Piece,
        excluding: &BTreeSet<CounterpartyId>,
    ) -> Result<Vec<CounterpartyId>, DispatchError>;

    async fn propose_deal(
        &self,
        piece: &Piece,
        counterparty: &CounterpartyId,
    ) -> Result<DealOutcome, DispatchError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EligibleRequest {
    pub piece_id: String,
    pub content_id: String,
    pub byte_size: u64,
    pub excluding: Vec<CounterpartyId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EligibleResponse {
    pub counterparties: Vec<CounterpartyId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProposalRequest {
    pub piece_id: String,
    pub content_id: String,
    pub byte_size: u64,
    pub aux_checksum: Option<String>,
    pub counterparty: CounterpartyId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProposalResponse {
    pub status: ProposalStatus,
    #[serde(default)]
    pub message: Option<String>,
}

/// JSON-over-HTTP market API.
///
/// `POST {base}/v1/counterparties/eligible` and `POST {base}/v1/deals`, both
/// authenticated with a bearer token when one is configured.
pub struct HttpDealMarket {
    base: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpDealMarket {
    pub fn new(
        base: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Rpc(e.to_string()))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            client,
        })
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        route: &str,
        body: &Req,
    ) -> Result<Resp, DispatchError> {
        let mut req = self.client.post(format!("{}{route}", self.base)).json(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| DispatchError::Rpc(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(DispatchError::Rpc(format!("{route}: {status}: {text}")));
        }
        resp.json()
            .await
            .map_err(|e| DispatchError::Rpc(format!("{route}: {e}")))
    }
}

#[async_trait]
impl DealMarket for HttpDealMarket {
    async fn list_eligible(
        &self,
        piece: &Piece,
        excluding: &BTreeSet<CounterpartyId>,
    ) -> Result<Vec<CounterpartyId>, DispatchError> {
        let body = EligibleRequest {
            piece_id: piece.piece_id.to_string(),
            content_id: piece.archive.content_id.to_hex(),
            byte_size: piece.archive.byte_size,
            excluding: excluding.iter().cloned().collect(),
        };
        let resp: EligibleResponse = self.post("/v1/counterparties/eligible", &body).await?;
        Ok(resp.counterparties)
    }

    async fn propose_deal(
        &self,
        piece: &Piece,
        counterparty: &CounterpartyId,
    ) -> Result<DealOutcome, DispatchError> {
        let body = ProposalRequest {
            piece_id: piece.piece_id.to_string(),
            content_id: piece.archive.content_id.to_hex(),
            byte_size: piece.archive.byte_size,
            aux_checksum: piece.archive.aux_checksum.clone(),
            counterparty: counterparty.clone(),
        };
        let resp: ProposalResponse = self.post("/v1/deals", &body).await?;
        Ok(match resp.status {
            ProposalStatus::Accepted => DealOutcome::Accepted,
            ProposalStatus::Rejected => {
                tracing::debug!(
                    %counterparty,
                    reason = resp.message.as_deref().unwrap_or(""),
                    "deal rejected"
                );
                DealOutcome::Rejected
            }
        })
    }
}
