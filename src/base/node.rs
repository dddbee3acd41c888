use super::keys::{NetworkId, PrivateKey, PublicKey, Signature};
use super::BaseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_ADDRESS_LEN: usize = 300;

/// Printable node identifier; ordering and equality are on the string form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress(String);

impl NodeAddress {
    pub fn new(address: impl Into<String>) -> Result<Self, BaseError> {
        let address = address.into();
        if address.is_empty()
            || address.len() > MAX_ADDRESS_LEN
            || address.chars().any(char::is_whitespace)
        {
            return Err(BaseError::InvalidAddress(address));
        }
        Ok(NodeAddress(address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = BaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        NodeAddress::new(value)
    }
}

impl From<NodeAddress> for String {
    fn from(a: NodeAddress) -> Self {
        a.0
    }
}

impl FromStr for NodeAddress {
    type Err = BaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeAddress::new(s)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub address: NodeAddress,
    pub publickey: PublicKey,
}

impl Node {
    pub fn new(address: NodeAddress, publickey: PublicKey) -> Self {
        Node { address, publickey }
    }

    pub fn hash_bytes(&self) -> Vec<u8> {
        let mut b = self.address.as_bytes().to_vec();
        b.extend_from_slice(&self.publickey.to_bytes());
        b
    }
}

/// The node this process runs as; owns the private key.
#[derive(Clone, Debug)]
pub struct LocalNode {
    node: Node,
    privatekey: PrivateKey,
}

impl LocalNode {
    pub fn new(address: NodeAddress, privatekey: PrivateKey) -> Self {
        LocalNode {
            node: Node::new(address, privatekey.public_key()),
            privatekey,
        }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.node.address
    }

    pub fn publickey(&self) -> PublicKey {
        self.node.publickey
    }

    pub fn privatekey(&self) -> &PrivateKey {
        &self.privatekey
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn sign(&self, network_id: &NetworkId, msg: &[u8]) -> Signature {
        self.privatekey.sign(network_id, msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation() {
        assert!(NodeAddress::new("node-a").is_ok());
        assert!(NodeAddress::new("").is_err());
        assert!(NodeAddress::new("has space").is_err());
        assert!(serde_json::from_str::<NodeAddress>("\"\"").is_err());
    }

    #[test]
    fn addresses_order_by_string() {
        let mut v: Vec<NodeAddress> = ["c", "a", "b"]
            .iter()
            .map(|s| NodeAddress::new(*s).unwrap())
            .collect();
        v.sort();
        assert_eq!(v.iter().map(|a| a.as_str()).collect::<Vec<_>>(), ["a", "b", "c"]);
    }
}
