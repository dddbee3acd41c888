//! `NetworkClient` over HTTP with reqwest.

use super::{
    ChallengeRequest, ChallengeResponse, ConnInfo, LastBlockMapResponse, NetworkClient, NetworkError, NetworkResult,
    ProposalRequest,
};
use crate::base::{Hash, Height, NodeAddress, Point, Signature};
use crate::block::{BlockMap, BlockMapItemType};
use crate::consensus::{Ballot, ProposalSignFact, SuffrageProof};
use crate::state::Operation;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Deserialize)]
struct Added {
    added: bool,
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    max_message_size: u64,
}

impl HttpClient {
    pub fn new(timeout: Duration, max_message_size: u64) -> NetworkResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| NetworkError::Request {
            url: String::new(),
            reason: e.to_string(),
        })?;
        Ok(HttpClient {
            client,
            max_message_size,
        })
    }

    fn url(conn: &ConnInfo, path: &str) -> String {
        format!("{}{}", conn.url.trim_end_matches('/'), path)
    }

    /// Sends `req` and returns the body; `None` on 404 or 204.
    async fn fetch(&self, url: &str, req: RequestBuilder) -> NetworkResult<Option<Vec<u8>>> {
        let res = req.send().await.map_err(|e| request_error(url, e))?;
        let status = res.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if let Some(size) = res.content_length() {
            self.check_size(size)?;
        }
        if !status.is_success() {
            let message = res.text().await.unwrap_or_default();
            return Err(NetworkError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                message,
            });
        }
        let body = res.bytes().await.map_err(|e| request_error(url, e))?;
        self.check_size(body.len() as u64)?;
        Ok(Some(body.to_vec()))
    }

    fn check_size(&self, size: u64) -> NetworkResult<()> {
        if size > self.max_message_size {
            return Err(NetworkError::TooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, conn: &ConnInfo, path: &str) -> NetworkResult<Option<T>> {
        let url = Self::url(conn, path);
        debug!(%url, "GET");
        match self.fetch(&url, self.client.get(&url)).await? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }

    async fn post_json<B, T>(&self, conn: &ConnInfo, path: &str, body: &B) -> NetworkResult<Option<T>>
    where
        B: serde::Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = Self::url(conn, path);
        let payload = serde_json::to_vec(body)?;
        self.check_size(payload.len() as u64)?;
        debug!(%url, size = payload.len(), "POST");
        let req = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload);
        match self.fetch(&url, req).await? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }
}

fn request_error(url: &str, err: reqwest::Error) -> NetworkError {
    if err.is_timeout() {
        NetworkError::Timeout(url.to_string())
    } else {
        NetworkError::Request {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

fn missing(conn: &ConnInfo, what: &str) -> NetworkError {
    NetworkError::Status {
        url: conn.url.clone(),
        status: 404,
        message: format!("{what} not found"),
    }
}

#[async_trait]
impl NetworkClient for HttpClient {
    async fn send_ballots(&self, conn: &ConnInfo, ballots: &[Ballot]) -> NetworkResult<()> {
        self.post_json::<_, serde_json::Value>(conn, "/ballots", ballots).await?;
        Ok(())
    }

    async fn operation(&self, conn: &ConnInfo, hash: &Hash) -> NetworkResult<Option<Operation>> {
        self.get_json(conn, &format!("/operation/{hash}")).await
    }

    async fn send_operation(&self, conn: &ConnInfo, operation: &Operation) -> NetworkResult<bool> {
        let res: Option<Added> = self.post_json(conn, "/operation", operation).await?;
        Ok(res.is_some_and(|r| r.added))
    }

    async fn request_proposal(
        &self,
        conn: &ConnInfo,
        point: Point,
        proposer: &NodeAddress,
    ) -> NetworkResult<Option<ProposalSignFact>> {
        let req = ProposalRequest {
            point,
            proposer: proposer.clone(),
        };
        self.post_json(conn, "/proposal/request", &req).await
    }

    async fn proposal(&self, conn: &ConnInfo, fact: &Hash) -> NetworkResult<Option<ProposalSignFact>> {
        self.get_json(conn, &format!("/proposal/{fact}")).await
    }

    async fn last_suffrage_proof(
        &self,
        conn: &ConnInfo,
        known: Option<Height>,
    ) -> NetworkResult<Option<SuffrageProof>> {
        let path = match known {
            Some(h) => format!("/suffrage_proof/last?known={}", h.get()),
            None => "/suffrage_proof/last".to_string(),
        };
        self.get_json(conn, &path).await
    }

    async fn suffrage_proof(&self, conn: &ConnInfo, suffrage_height: Height) -> NetworkResult<Option<SuffrageProof>> {
        self.get_json(conn, &format!("/suffrage_proof/{}", suffrage_height.get())).await
    }

    async fn last_blockmap(
        &self,
        conn: &ConnInfo,
        known: Option<Hash>,
    ) -> NetworkResult<(Option<BlockMap>, bool)> {
        let path = match known {
            Some(h) => format!("/blockmap/last?known={h}"),
            None => "/blockmap/last".to_string(),
        };
        let res: Option<LastBlockMapResponse> = self.get_json(conn, &path).await?;
        Ok(res.map_or((None, false), |r| (r.blockmap, r.updated)))
    }

    async fn blockmap(&self, conn: &ConnInfo, height: Height) -> NetworkResult<Option<BlockMap>> {
        self.get_json(conn, &format!("/blockmap/{}", height.get())).await
    }

    async fn blockmap_item(
        &self,
        conn: &ConnInfo,
        height: Height,
        item_type: BlockMapItemType,
    ) -> NetworkResult<Option<Vec<u8>>> {
        let url = Self::url(conn, &format!("/blockmap/{}/item/{item_type}", height.get()));
        self.fetch(&url, self.client.get(&url)).await
    }

    async fn node_challenge(&self, conn: &ConnInfo, input: &[u8]) -> NetworkResult<Signature> {
        let req = ChallengeRequest {
            input: hex::encode(input),
        };
        let res: Option<ChallengeResponse> = self.post_json(conn, "/node_challenge", &req).await?;
        res.map(|r| r.signature).ok_or_else(|| missing(conn, "challenge"))
    }

    async fn sync_sources(&self, conn: &ConnInfo) -> NetworkResult<Vec<ConnInfo>> {
        let res: Option<Vec<ConnInfo>> = self.get_json(conn, "/sync_sources").await?;
        Ok(res.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_urls() {
        let conn = ConnInfo {
            address: NodeAddress::new("a").unwrap(),
            publickey: crate::base::PrivateKey::generate().public_key(),
            url: "http://127.0.0.1:4320/".to_string(),
        };
        assert_eq!(HttpClient::url(&conn, "/blockmap/3"), "http://127.0.0.1:4320/blockmap/3");
    }

    #[test]
    fn rejects_large_messages() {
        let client = HttpClient::new(Duration::from_secs(1), 10).unwrap();
        assert!(client.check_size(10).is_ok());
        assert!(matches!(client.check_size(11), Err(NetworkError::TooLarge { size: 11, limit: 10 })));
    }
}
