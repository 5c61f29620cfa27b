//! [`ChainOracle`] over Celo core contracts via `eth_call`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_dyn_abi::DynSolValue;
use alloy_primitives::Address;
use async_trait::async_trait;
use serde_json::{json, Value};

use rpcwatch_core::{ChainOracle, EntityKind, GroupRoster, MembershipEntry, WatchError};

use crate::contracts::{
    address_arg, address_at, addresses_at, string_at, u64_at, u64s_at, uint_arg, CeloAbi,
    ContractCall, ACCOUNTS, ELECTION, REGISTRY_ADDRESS, VALIDATORS,
};
use crate::error::TransportError;
use crate::metadata::MetadataClient;
use crate::rpc::{block_tag, parse_hex_u64};
use crate::transport::RpcTransport;

/// Reads registry state from one node.
///
/// Core-contract addresses are resolved through the Registry on first use
/// and cached for the lifetime of the oracle.
pub struct CeloOracle {
    transport: Arc<dyn RpcTransport>,
    metadata: MetadataClient,
    abi: CeloAbi,
    resolved: Mutex<HashMap<&'static str, Address>>,
}

impl CeloOracle {
    pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(transport: Arc<dyn RpcTransport>) -> Result<Self, TransportError> {
        Self::with_metadata_timeout(transport, Self::DEFAULT_METADATA_TIMEOUT)
    }

    pub fn with_metadata_timeout(
        transport: Arc<dyn RpcTransport>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            transport,
            metadata: MetadataClient::new(timeout)?,
            abi: CeloAbi::new()?,
            resolved: Mutex::new(HashMap::new()),
        })
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    async fn eth_call(
        &self,
        to: Address,
        calldata: Vec<u8>,
        height: Option<u64>,
    ) -> Result<Vec<u8>, TransportError> {
        let tag = height.map(block_tag).unwrap_or_else(|| "latest".to_string());
        let params = vec![
            json!({
                "to": format!("0x{}", hex::encode(to)),
                "data": format!("0x{}", hex::encode(calldata)),
            }),
            Value::String(tag),
        ];
        let result = self.transport.request("eth_call", params).await?;
        let data = result
            .as_str()
            .ok_or_else(|| TransportError::Abi("eth_call result is not a string".into()))?;
        hex::decode(data.trim_start_matches("0x"))
            .map_err(|e| TransportError::Abi(format!("eth_call result is not hex: {e}")))
    }

    /// Resolve a core contract by registry name.
    async fn contract(&self, name: &'static str) -> Result<Address, TransportError> {
        if let Some(addr) = self.cached(name) {
            return Ok(addr);
        }
        let calldata = self
            .abi
            .address_for_string
            .encode(vec![DynSolValue::String(name.to_string())])?;
        let data = self.eth_call(REGISTRY_ADDRESS, calldata, None).await?;
        let addr = address_at(&self.abi.address_for_string.decode(&data)?, 0)?;
        if addr == Address::ZERO {
            return Err(TransportError::Abi(format!("{name} is not registered")));
        }
        tracing::debug!(contract = name, address = %addr, "resolved core contract");
        if let Ok(mut map) = self.resolved.lock() {
            map.insert(name, addr);
        }
        Ok(addr)
    }

    fn cached(&self, name: &'static str) -> Option<Address> {
        self.resolved.lock().ok().and_then(|map| map.get(name).copied())
    }

    async fn call(
        &self,
        contract: &'static str,
        call: &ContractCall,
        args: Vec<DynSolValue>,
        height: Option<u64>,
    ) -> Result<Vec<DynSolValue>, TransportError> {
        let to = self.contract(contract).await?;
        let data = self.eth_call(to, call.encode(args)?, height).await?;
        call.decode(&data)
    }

    async fn name_of(
        &self,
        address: &str,
        height: Option<u64>,
    ) -> Result<Option<String>, TransportError> {
        let values = self
            .call(ACCOUNTS, &self.abi.get_name, vec![address_arg(address)?], height)
            .await?;
        let name = string_at(&values, 0)?;
        Ok(Some(name).filter(|n| !n.is_empty()))
    }
}

fn render(addrs: Vec<Address>) -> Vec<String> {
    addrs.into_iter().map(|a| a.to_checksum(None)).collect()
}

#[async_trait]
impl ChainOracle for CeloOracle {
    async fn registered_addresses(&self, kind: EntityKind) -> Result<Vec<String>, WatchError> {
        let call = match kind {
            EntityKind::Validator => &self.abi.registered_validators,
            EntityKind::Group => &self.abi.registered_groups,
        };
        let values = self.call(VALIDATORS, call, vec![], None).await?;
        Ok(render(addresses_at(&values, 0)?))
    }

    async fn current_height(&self) -> Result<u64, WatchError> {
        let result = self.transport.request("eth_blockNumber", vec![]).await?;
        result
            .as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| WatchError::Rpc(format!("unexpected eth_blockNumber result: {result}")))
    }

    async fn epoch_at(&self, height: u64) -> Result<u64, WatchError> {
        let values = self
            .call(VALIDATORS, &self.abi.epoch_of_block, vec![uint_arg(height)], None)
            .await?;
        Ok(u64_at(&values, 0)?)
    }

    async fn display_name(
        &self,
        address: &str,
        height: u64,
    ) -> Result<Option<String>, WatchError> {
        Ok(self.name_of(address, Some(height)).await?)
    }

    async fn group_roster(
        &self,
        group: &str,
        include_members: bool,
    ) -> Result<GroupRoster, WatchError> {
        let name = self.name_of(group, None).await?;
        let members = if include_members {
            let values = self
                .call(VALIDATORS, &self.abi.validator_group, vec![address_arg(group)?], None)
                .await?;
            render(addresses_at(&values, 0)?)
        } else {
            Vec::new()
        };
        Ok(GroupRoster { name, members })
    }

    async fn membership_history(
        &self,
        validator: &str,
    ) -> Result<Vec<MembershipEntry>, WatchError> {
        let values = self
            .call(VALIDATORS, &self.abi.membership_history, vec![address_arg(validator)?], None)
            .await?;
        let epochs = u64s_at(&values, 0)?;
        let groups = addresses_at(&values, 1)?;
        if epochs.len() != groups.len() {
            return Err(WatchError::Rpc(format!(
                "membership history for {validator} has {} epochs but {} groups",
                epochs.len(),
                groups.len()
            )));
        }
        Ok(epochs
            .into_iter()
            .zip(render(groups))
            .map(|(epoch, group)| MembershipEntry { epoch, group })
            .collect())
    }

    async fn signer_to_entity(&self, signer: &str) -> Result<String, WatchError> {
        let values = self
            .call(ACCOUNTS, &self.abi.signer_to_account, vec![address_arg(signer)?], None)
            .await?;
        Ok(address_at(&values, 0)?.to_checksum(None))
    }

    async fn current_live_set(&self) -> Result<Vec<String>, WatchError> {
        let values = self.call(ELECTION, &self.abi.current_signers, vec![], None).await?;
        Ok(render(addresses_at(&values, 0)?))
    }

    async fn endpoint_url(&self, address: &str) -> Result<Option<String>, WatchError> {
        let values = self
            .call(ACCOUNTS, &self.abi.metadata_url, vec![address_arg(address)?], None)
            .await?;
        let metadata_url = string_at(&values, 0)?;
        let metadata_url = metadata_url.trim();
        if metadata_url.is_empty() {
            return Ok(None);
        }
        Ok(self.metadata.rpc_url(metadata_url).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{JsonRpcRequest, JsonRpcResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn addr(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address::from(bytes)
    }

    /// Answers `eth_call` from a table keyed by `to` and calldata.
    #[derive(Default)]
    struct FakeNode {
        calls: Mutex<HashMap<(String, String), Vec<u8>>>,
        tags: Mutex<Vec<String>>,
        requests: AtomicUsize,
    }

    impl FakeNode {
        fn answer(&self, to: Address, calldata: Vec<u8>, outputs: Vec<DynSolValue>) {
            let key = (format!("0x{}", hex::encode(to)), format!("0x{}", hex::encode(calldata)));
            let data = DynSolValue::Tuple(outputs).abi_encode_params();
            self.calls.lock().unwrap().insert(key, data);
        }
    }

    #[async_trait]
    impl RpcTransport for FakeNode {
        async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let result = match req.method.as_str() {
                "eth_blockNumber" => Value::String("0x2a".into()),
                "eth_call" => {
                    let to = req.params[0]["to"].as_str().unwrap().to_string();
                    let data = req.params[0]["data"].as_str().unwrap().to_string();
                    self.tags.lock().unwrap().push(req.params[1].as_str().unwrap().to_string());
                    let reply = self.calls.lock().unwrap().get(&(to, data)).cloned();
                    match reply {
                        Some(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
                        None => Value::String("0x".into()),
                    }
                }
                other => panic!("unexpected method {other}"),
            };
            Ok(JsonRpcResponse { jsonrpc: "2.0".into(), id: req.id, result: Some(result), error: None })
        }

        fn url(&self) -> &str {
            "fake"
        }
    }

    const VALIDATORS_ADDR: u8 = 0xa1;
    const ACCOUNTS_ADDR: u8 = 0xa2;

    fn node() -> (Arc<FakeNode>, CeloAbi) {
        let abi = CeloAbi::new().unwrap();
        let node = Arc::new(FakeNode::default());
        for (name, at) in [(VALIDATORS, VALIDATORS_ADDR), (ACCOUNTS, ACCOUNTS_ADDR)] {
            node.answer(
                REGISTRY_ADDRESS,
                abi.address_for_string.encode(vec![DynSolValue::String(name.into())]).unwrap(),
                vec![DynSolValue::Address(addr(at))],
            );
        }
        (node, abi)
    }

    #[tokio::test]
    async fn current_height_parses_hex() {
        let (fake, _) = node();
        let oracle = CeloOracle::new(fake).unwrap();
        assert_eq!(oracle.current_height().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn registry_lookup_is_cached() {
        let (fake, abi) = node();
        fake.answer(
            addr(VALIDATORS_ADDR),
            abi.registered_validators.encode(vec![]).unwrap(),
            vec![DynSolValue::Array(vec![DynSolValue::Address(addr(1)), DynSolValue::Address(addr(2))])],
        );
        let oracle = CeloOracle::new(fake.clone()).unwrap();

        let first = oracle.registered_addresses(EntityKind::Validator).await.unwrap();
        assert_eq!(first, vec![addr(1).to_checksum(None), addr(2).to_checksum(None)]);
        assert_eq!(fake.requests.load(Ordering::SeqCst), 2);

        oracle.registered_addresses(EntityKind::Validator).await.unwrap();
        assert_eq!(fake.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn display_name_reads_at_height_and_blank_is_none() {
        let (fake, abi) = node();
        let who = addr(5).to_checksum(None);
        fake.answer(
            addr(ACCOUNTS_ADDR),
            abi.get_name.encode(vec![DynSolValue::Address(addr(5))]).unwrap(),
            vec![DynSolValue::String(String::new())],
        );
        let oracle = CeloOracle::new(fake.clone()).unwrap();

        assert_eq!(oracle.display_name(&who, 436).await.unwrap(), None);
        assert_eq!(fake.tags.lock().unwrap().last().map(String::as_str), Some("0x1b4"));
    }

    #[tokio::test]
    async fn membership_history_pairs_epochs_with_groups() {
        let (fake, abi) = node();
        fake.answer(
            addr(VALIDATORS_ADDR),
            abi.membership_history.encode(vec![DynSolValue::Address(addr(5))]).unwrap(),
            vec![
                DynSolValue::Array(vec![uint_arg(10), uint_arg(12)]),
                DynSolValue::Array(vec![DynSolValue::Address(addr(7)), DynSolValue::Address(addr(8))]),
                uint_arg(0),
                uint_arg(0),
            ],
        );
        let oracle = CeloOracle::new(fake).unwrap();

        let history = oracle.membership_history(&addr(5).to_checksum(None)).await.unwrap();
        assert_eq!(
            history,
            vec![
                MembershipEntry { epoch: 10, group: addr(7).to_checksum(None) },
                MembershipEntry { epoch: 12, group: addr(8).to_checksum(None) },
            ]
        );
    }

    #[tokio::test]
    async fn empty_metadata_url_means_no_endpoint() {
        let (fake, abi) = node();
        fake.answer(
            addr(ACCOUNTS_ADDR),
            abi.metadata_url.encode(vec![DynSolValue::Address(addr(5))]).unwrap(),
            vec![DynSolValue::String("  ".into())],
        );
        let oracle = CeloOracle::new(fake).unwrap();
        assert_eq!(oracle.endpoint_url(&addr(5).to_checksum(None)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unregistered_contract_is_a_transient_error() {
        let oracle = CeloOracle::new(Arc::new(FakeNode::default())).unwrap();
        let err = oracle.current_live_set().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn malformed_address_is_rejected_before_any_call() {
        let (fake, _) = node();
        let oracle = CeloOracle::new(fake.clone()).unwrap();
        assert!(oracle.signer_to_entity("bogus").await.is_err());
        assert_eq!(fake.requests.load(Ordering::SeqCst), 0);
    }
}
