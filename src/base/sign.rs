use super::hash::Hash;
use super::keys::{NetworkId, PublicKey, Signature};
use super::node::{LocalNode, NodeAddress};
use super::BaseError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One signature over a fact hash. A node sign also names the signer's
/// address, and the address is part of the signed message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sign {
    pub signer: PublicKey,
    pub signature: Signature,
    pub signed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeAddress>,
}

impl Sign {
    pub fn new(local: &LocalNode, network_id: &NetworkId, fact_hash: &Hash) -> Self {
        Self::sign_at(local, network_id, fact_hash, Utc::now())
    }

    pub fn sign_at(
        local: &LocalNode,
        network_id: &NetworkId,
        fact_hash: &Hash,
        signed_at: DateTime<Utc>,
    ) -> Self {
        let node = Some(local.address().clone());
        let msg = Self::message(fact_hash, node.as_ref(), &signed_at);
        Sign {
            signer: local.publickey(),
            signature: local.sign(network_id, &msg),
            signed_at,
            node,
        }
    }

    fn message(fact_hash: &Hash, node: Option<&NodeAddress>, signed_at: &DateTime<Utc>) -> Vec<u8> {
        let mut msg = fact_hash.as_bytes().to_vec();
        if let Some(node) = node {
            msg.extend_from_slice(node.as_bytes());
        }
        msg.extend_from_slice(signed_at.to_rfc3339_opts(SecondsFormat::Nanos, true).as_bytes());
        msg
    }

    pub fn verify(&self, network_id: &NetworkId, fact_hash: &Hash) -> Result<(), BaseError> {
        let msg = Self::message(fact_hash, self.node.as_ref(), &self.signed_at);
        self.signer.verify(network_id, &msg, &self.signature)
    }

    pub fn hash_bytes(&self) -> Vec<u8> {
        let mut b = self.signer.to_bytes().to_vec();
        b.extend_from_slice(self.signature.as_bytes());
        b.extend_from_slice(
            self.signed_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::keys::PrivateKey;

    #[test]
    fn node_sign_survives_json() {
        let network_id = NetworkId::new("n").unwrap();
        let local = LocalNode::new(NodeAddress::new("a").unwrap(), PrivateKey::generate());
        let fact = Hash::digest(b"fact");

        let sign = Sign::new(&local, &network_id, &fact);
        assert!(sign.verify(&network_id, &fact).is_ok());

        let back: Sign = serde_json::from_str(&serde_json::to_string(&sign).unwrap()).unwrap();
        assert_eq!(back, sign);
        assert!(back.verify(&network_id, &fact).is_ok());
    }

    #[test]
    fn tampered_node_fails() {
        let network_id = NetworkId::new("n").unwrap();
        let local = LocalNode::new(NodeAddress::new("a").unwrap(), PrivateKey::generate());
        let fact = Hash::digest(b"fact");

        let mut sign = Sign::new(&local, &network_id, &fact);
        sign.node = Some(NodeAddress::new("b").unwrap());
        assert!(sign.verify(&network_id, &fact).is_err());
    }
}
