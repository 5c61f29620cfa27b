//! Celo core-contract call encoding and return-data decoding.
//!
//! Core contracts are located through the on-chain Registry at a fixed
//! address; every other address is resolved from it by contract name.
//!
//! # How it works
//! - calldata = 4-byte selector ++ ABI-encoded input tuple
//! - return data = ABI-encoded output tuple (no selector)

use alloy_dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy_json_abi::Function;
use alloy_primitives::{address, Address, U256};

use crate::error::TransportError;

/// The Registry predeploy.
pub const REGISTRY_ADDRESS: Address = address!("000000000000000000000000000000000000ce10");

pub const ACCOUNTS: &str = "Accounts";
pub const VALIDATORS: &str = "Validators";
pub const ELECTION: &str = "Election";

/// A single view function, parsed from a human-readable signature.
#[derive(Debug, Clone)]
pub struct ContractCall {
    function: Function,
    inputs: Vec<DynSolType>,
    outputs: Vec<DynSolType>,
}

impl ContractCall {
    /// Parse e.g. `"getName(address) returns (string)"`.
    pub fn parse(signature: &str) -> Result<Self, TransportError> {
        let function = Function::parse(signature)
            .map_err(|e| TransportError::Abi(format!("signature '{signature}': {e}")))?;
        let inputs = function
            .inputs
            .iter()
            .map(|p| p.resolve().map_err(|e| TransportError::Abi(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = function
            .outputs
            .iter()
            .map(|p| p.resolve().map_err(|e| TransportError::Abi(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { function, inputs, outputs })
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Build calldata for `args`, which must match the declared inputs.
    pub fn encode(&self, args: Vec<DynSolValue>) -> Result<Vec<u8>, TransportError> {
        if args.len() != self.inputs.len() {
            return Err(TransportError::Abi(format!(
                "{}: argument count mismatch: ABI has {}, got {}",
                self.name(),
                self.inputs.len(),
                args.len()
            )));
        }
        for (i, (ty, arg)) in self.inputs.iter().zip(args.iter()).enumerate() {
            if !ty.matches(arg) {
                return Err(TransportError::Abi(format!(
                    "{}: param {i} is not a {ty}",
                    self.name()
                )));
            }
        }

        let mut calldata = self.function.selector().to_vec();
        calldata.extend_from_slice(&DynSolValue::Tuple(args).abi_encode_params());
        Ok(calldata)
    }

    /// Decode return data into one value per declared output.
    pub fn decode(&self, data: &[u8]) -> Result<Vec<DynSolValue>, TransportError> {
        if data.is_empty() && !self.outputs.is_empty() {
            return Err(TransportError::Abi(format!("{}: empty return data", self.name())));
        }
        let decoded = DynSolType::Tuple(self.outputs.clone())
            .abi_decode_params(data)
            .map_err(|e| TransportError::Abi(format!("{}: {e}", self.name())))?;
        match decoded {
            DynSolValue::Tuple(values) => Ok(values),
            single => Ok(vec![single]),
        }
    }
}

/// The view functions the oracle needs, parsed once.
#[derive(Debug, Clone)]
pub struct CeloAbi {
    pub address_for_string: ContractCall,
    pub get_name: ContractCall,
    pub signer_to_account: ContractCall,
    pub metadata_url: ContractCall,
    pub registered_validators: ContractCall,
    pub registered_groups: ContractCall,
    pub validator_group: ContractCall,
    pub membership_history: ContractCall,
    pub epoch_of_block: ContractCall,
    pub current_signers: ContractCall,
}

impl CeloAbi {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            address_for_string: ContractCall::parse(
                "getAddressForString(string) returns (address)",
            )?,
            get_name: ContractCall::parse("getName(address) returns (string)")?,
            signer_to_account: ContractCall::parse("signerToAccount(address) returns (address)")?,
            metadata_url: ContractCall::parse("getMetadataURL(address) returns (string)")?,
            registered_validators: ContractCall::parse(
                "getRegisteredValidators() returns (address[])",
            )?,
            registered_groups: ContractCall::parse(
                "getRegisteredValidatorGroups() returns (address[])",
            )?,
            validator_group: ContractCall::parse(
                "getValidatorGroup(address) returns (address[], uint256, uint256, uint256, uint256[], uint256, uint256)",
            )?,
            membership_history: ContractCall::parse(
                "getMembershipHistory(address) returns (uint256[], address[], uint256, uint256)",
            )?,
            epoch_of_block: ContractCall::parse("getEpochNumberOfBlock(uint256) returns (uint256)")?,
            current_signers: ContractCall::parse(
                "getCurrentValidatorSigners() returns (address[])",
            )?,
        })
    }
}

// ─── Value extraction ────────────────────────────────────────────────────────

pub fn parse_address(s: &str) -> Result<Address, TransportError> {
    s.trim()
        .parse::<Address>()
        .map_err(|e| TransportError::Abi(format!("invalid address '{s}': {e}")))
}

pub fn address_arg(s: &str) -> Result<DynSolValue, TransportError> {
    parse_address(s).map(DynSolValue::Address)
}

pub fn uint_arg(n: u64) -> DynSolValue {
    DynSolValue::Uint(U256::from(n), 256)
}

fn output<'a>(values: &'a [DynSolValue], i: usize) -> Result<&'a DynSolValue, TransportError> {
    values
        .get(i)
        .ok_or_else(|| TransportError::Abi(format!("missing return value {i}")))
}

pub fn address_at(values: &[DynSolValue], i: usize) -> Result<Address, TransportError> {
    output(values, i)?
        .as_address()
        .ok_or_else(|| TransportError::Abi(format!("return value {i} is not an address")))
}

pub fn string_at(values: &[DynSolValue], i: usize) -> Result<String, TransportError> {
    output(values, i)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| TransportError::Abi(format!("return value {i} is not a string")))
}

pub fn u64_at(values: &[DynSolValue], i: usize) -> Result<u64, TransportError> {
    to_u64(output(values, i)?)
}

pub fn addresses_at(values: &[DynSolValue], i: usize) -> Result<Vec<Address>, TransportError> {
    array_at(values, i)?
        .iter()
        .map(|v| {
            v.as_address()
                .ok_or_else(|| TransportError::Abi(format!("return value {i} holds a non-address")))
        })
        .collect()
}

pub fn u64s_at(values: &[DynSolValue], i: usize) -> Result<Vec<u64>, TransportError> {
    array_at(values, i)?.iter().map(to_u64).collect()
}

fn array_at(values: &[DynSolValue], i: usize) -> Result<&[DynSolValue], TransportError> {
    output(values, i)?
        .as_array()
        .ok_or_else(|| TransportError::Abi(format!("return value {i} is not an array")))
}

fn to_u64(v: &DynSolValue) -> Result<u64, TransportError> {
    let (n, _) = v
        .as_uint()
        .ok_or_else(|| TransportError::Abi("expected a uint".into()))?;
    u64::try_from(n).map_err(|_| TransportError::Abi(format!("uint {n} does not fit in u64")))
}
