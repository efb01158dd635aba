use ethereum_types::{H256, U256};

/// The hash value of an account empty EVM code.
/// 0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470
pub const EMPTY_CODE_HASH: H256 = H256([
    197, 210, 70, 1, 134, 247, 35, 60, 146, 126, 125, 178, 220, 199, 3, 192, 229, 0, 182, 83, 202,
    130, 39, 59, 123, 250, 216, 4, 93, 133, 164, 112,
]);

/// The root of a state trie holding no keys. This is the L1 commitment of an
/// empty chain state.
/// 0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421
pub const EMPTY_TRIE_HASH: H256 = H256([
    86, 232, 31, 23, 27, 204, 85, 166, 255, 131, 69, 230, 146, 192, 248, 110, 91, 72, 224, 27, 153,
    108, 173, 192, 1, 98, 47, 181, 227, 99, 180, 33,
]);

/// Chain id reported by the EVM of a freshly created chain.
pub const DEFAULT_EVM_CHAIN_ID: u16 = 1074;

/// Gas limit of every emulated EVM block.
pub const EVM_BLOCK_GAS_LIMIT: u64 = 15_000_000;

/// Decimals of the L1 base token.
pub const BASE_TOKEN_DECIMALS: u32 = 6;

/// Off-ledger nonces further than this from the highest processed nonce of a
/// sender are refused.
pub const OFF_LEDGER_NONCE_STRICT_ORDER_TOLERANCE: u64 = 10_000;

/// Largest encoded off-ledger request a node takes in.
pub const MAX_OFF_LEDGER_REQUEST_SIZE: usize = 32 * 1024;

/// Converts an amount of base tokens to the 18-decimals unit the EVM works
/// with.
pub fn base_tokens_to_wei(amount: u64) -> U256 {
    U256::from(amount) * U256::from(10).pow((18 - BASE_TOKEN_DECIMALS).into())
}

/// Converts an EVM amount back to base tokens, returning the remainder that
/// cannot be represented with [`BASE_TOKEN_DECIMALS`].
pub fn wei_to_base_tokens(wei: U256) -> (U256, U256) {
    let factor = U256::from(10).pow((18 - BASE_TOKEN_DECIMALS).into());
    (wei / factor, wei % factor)
}

#[test]
fn test_wei_conversion() {
    let wei = base_tokens_to_wei(7);
    assert_eq!(wei_to_base_tokens(wei), (U256::from(7), U256::zero()));
    assert_eq!(
        wei_to_base_tokens(wei + U256::one()),
        (U256::from(7), U256::one())
    );
}

#[test]
fn test_empty_code_hash() {
    assert_eq!(EMPTY_CODE_HASH, keccak_hash::keccak([]));
}

#[test]
fn test_empty_trie_hash() {
    assert_eq!(
        EMPTY_TRIE_HASH,
        keccak_hash::keccak(bytes::Bytes::from_static(&rlp::NULL_RLP))
    );
}
