//! Ethereum accounts and storage as keys of a [`KvStore`].
//!
//! Layout, relative to the store the db is opened on:
//!
//! | key                       | value                          |
//! |---------------------------|--------------------------------|
//! | `a` ++ address            | balance, big-endian, no zeros  |
//! | `n` ++ address            | nonce, little-endian `u64`     |
//! | `c` ++ address            | code                           |
//! | `s` ++ address ++ slot    | 32-byte slot value             |

use anchor_common::EMPTY_CODE_HASH;
use ethereum_types::{H160, H256, U256};
use keccak_hash::keccak;
use kv_state::codec::{decode_or, decode_u256, decode_u64, encode_u256, encode_u64};
use kv_state::kv::key_join;
use kv_state::{KvReader, KvStore};
use log::trace;

use super::{EvmError, EvmLog, EvmResult};

const KEY_BALANCE: &[u8] = b"a";
const KEY_NONCE: &[u8] = b"n";
const KEY_CODE: &[u8] = b"c";
const KEY_STORAGE: &[u8] = b"s";

fn account_key(prefix: &[u8], addr: &H160) -> Vec<u8> {
    key_join(&[prefix, addr.as_bytes()])
}

fn storage_key(addr: &H160, slot: &H256) -> Vec<u8> {
    key_join(&[KEY_STORAGE, addr.as_bytes(), slot.as_bytes()])
}

/// Ethereum state db over `kv`. Logs added during a transaction are kept in
/// memory until taken.
#[derive(Debug)]
pub struct EvmStateDb<S> {
    kv: S,
    logs: Vec<EvmLog>,
}

impl<S> EvmStateDb<S> {
    /// Opens the db on `kv`.
    pub fn new(kv: S) -> Self {
        Self {
            kv,
            logs: Vec::new(),
        }
    }

    /// Returns the store and the pending logs.
    pub fn into_parts(self) -> (S, Vec<EvmLog>) {
        (self.kv, self.logs)
    }

    /// The underlying store.
    pub fn kv(&self) -> &S {
        &self.kv
    }

    /// The underlying store, writable.
    pub fn kv_mut(&mut self) -> &mut S {
        &mut self.kv
    }

    /// Records a log.
    pub fn add_log(&mut self, log: EvmLog) {
        self.logs.push(log);
    }

    /// Logs recorded so far.
    pub fn get_logs(&self) -> &[EvmLog] {
        &self.logs
    }

    /// Takes the recorded logs.
    pub fn take_logs(&mut self) -> Vec<EvmLog> {
        std::mem::take(&mut self.logs)
    }

    /// Access lists are not metered: every address is warm.
    pub fn address_in_access_list(&self, _addr: &H160) -> bool {
        true
    }

    /// Access lists are not metered: every slot is warm.
    pub fn slot_in_access_list(&self, _addr: &H160, _slot: &H256) -> (bool, bool) {
        (true, true)
    }
}

impl<S: KvReader> EvmStateDb<S> {
    /// Balance of `addr` in wei.
    pub fn get_balance(&self, addr: &H160) -> EvmResult<U256> {
        Ok(decode_or(
            self.kv.get(&account_key(KEY_BALANCE, addr)),
            U256::zero(),
            decode_u256,
        )?)
    }

    /// Nonce of `addr`.
    pub fn get_nonce(&self, addr: &H160) -> EvmResult<u64> {
        Ok(decode_or(
            self.kv.get(&account_key(KEY_NONCE, addr)),
            0,
            decode_u64,
        )?)
    }

    /// Code of `addr`; empty for accounts without code.
    pub fn get_code(&self, addr: &H160) -> Vec<u8> {
        self.kv.get(&account_key(KEY_CODE, addr)).unwrap_or_default()
    }

    /// Keccak of the code of an existing account, zero for unknown ones.
    pub fn get_code_hash(&self, addr: &H160) -> H256 {
        match self.kv.get(&account_key(KEY_CODE, addr)) {
            Some(code) => keccak(code),
            None if self.exists(addr) => EMPTY_CODE_HASH,
            None => H256::zero(),
        }
    }

    /// Size of the code of `addr`.
    pub fn get_code_size(&self, addr: &H160) -> usize {
        self.get_code(addr).len()
    }

    /// Value of a storage slot; zero when never written.
    pub fn get_state(&self, addr: &H160, slot: &H256) -> H256 {
        self.kv
            .get(&storage_key(addr, slot))
            .filter(|v| v.len() == 32)
            .map(|v| H256::from_slice(&v))
            .unwrap_or_default()
    }

    /// Every non-zero slot of `addr`, in slot order.
    pub fn storage_of(&self, addr: &H160) -> Vec<(H256, H256)> {
        let prefix = key_join(&[KEY_STORAGE, addr.as_bytes()]);
        self.kv
            .entries(&prefix)
            .into_iter()
            .filter(|(k, v)| k.len() == prefix.len() + 32 && v.len() == 32)
            .map(|(k, v)| (H256::from_slice(&k[prefix.len()..]), H256::from_slice(&v)))
            .collect()
    }

    /// Whether anything is known about `addr`.
    pub fn exists(&self, addr: &H160) -> bool {
        [KEY_BALANCE, KEY_NONCE, KEY_CODE]
            .iter()
            .any(|p| self.kv.has(&account_key(p, addr)))
    }

    /// EIP-161 emptiness: zero nonce, zero balance and no code.
    pub fn empty(&self, addr: &H160) -> EvmResult<bool> {
        Ok(self.get_nonce(addr)? == 0
            && self.get_balance(addr)?.is_zero()
            && self.get_code_size(addr) == 0)
    }
}

impl<S: KvStore> EvmStateDb<S> {
    fn set_balance(&mut self, addr: &H160, v: U256) {
        let key = account_key(KEY_BALANCE, addr);
        match v.is_zero() {
            true => self.kv.del(&key),
            false => self.kv.set(&key, &encode_u256(&v)),
        }
    }

    /// Credits `amount` wei to `addr`.
    pub fn add_balance(&mut self, addr: &H160, amount: U256) -> EvmResult<()> {
        let next = self
            .get_balance(addr)?
            .checked_add(amount)
            .ok_or(EvmError::InsufficientBalance)?;
        self.set_balance(addr, next);
        Ok(())
    }

    /// Debits `amount` wei from `addr`.
    pub fn sub_balance(&mut self, addr: &H160, amount: U256) -> EvmResult<()> {
        let next = self
            .get_balance(addr)?
            .checked_sub(amount)
            .ok_or(EvmError::InsufficientBalance)?;
        self.set_balance(addr, next);
        Ok(())
    }

    /// Sets the nonce of `addr`.
    pub fn set_nonce(&mut self, addr: &H160, nonce: u64) {
        self.kv.set(&account_key(KEY_NONCE, addr), &encode_u64(nonce));
    }

    /// Installs `code` at `addr`.
    pub fn set_code(&mut self, addr: &H160, code: &[u8]) {
        let key = account_key(KEY_CODE, addr);
        match code.is_empty() {
            true => self.kv.del(&key),
            false => self.kv.set(&key, code),
        }
    }

    /// Writes a storage slot; a zero value clears it.
    pub fn set_state(&mut self, addr: &H160, slot: &H256, value: &H256) {
        let key = storage_key(addr, slot);
        match value.is_zero() {
            true => self.kv.del(&key),
            false => self.kv.set(&key, value.as_bytes()),
        }
    }

    /// Removes the account with its balance, nonce, code and storage.
    pub fn suicide(&mut self, addr: &H160) {
        trace!("Removing EVM account {addr:?}");
        for p in [KEY_BALANCE, KEY_NONCE, KEY_CODE] {
            self.kv.del(&account_key(p, addr));
        }
        let prefix = key_join(&[KEY_STORAGE, addr.as_bytes()]);
        let mut keys = Vec::new();
        self.kv.iterate_keys(&prefix, &mut |k| {
            keys.push(k.to_vec());
            true
        });
        for k in keys {
            self.kv.del(&k);
        }
    }
}
