//! Leaf encoding for the airdrop merkle tree.
//!
//! A leaf is the Solidity `abi.encodePacked(address, uint256, uint256)` of
//! `(account, reward, taskId)`: the 20 address bytes followed by two
//! big-endian, left-zero-padded 32-byte words. The verifying contract
//! recomputes `keccak256(abi.encodePacked(msg.sender, amount, taskId))`, so
//! any change to order or padding invalidates every proof.

use airdrop_common::{EncodingError, Task, TaskId, UserTaskRecord};
use ethereum_types::{Address, U256};

pub const ADDRESS_LEN: usize = 20;
pub const WORD_LEN: usize = 32;
pub const LEAF_LEN: usize = ADDRESS_LEN + WORD_LEN + WORD_LEN;

/// Encode one `(address, reward, task_id)` triple into its 84-byte leaf
pub fn encode(address: &Address, reward: U256, task_id: TaskId) -> [u8; LEAF_LEN] {
    let mut leaf = [0u8; LEAF_LEN];
    leaf[..ADDRESS_LEN].copy_from_slice(address.as_bytes());
    reward.to_big_endian(&mut leaf[ADDRESS_LEN..ADDRESS_LEN + WORD_LEN]);
    task_id.as_u256().to_big_endian(&mut leaf[ADDRESS_LEN + WORD_LEN..]);
    leaf
}

/// Encode a stored record using its task's reward
pub fn encode_record(record: &UserTaskRecord, task: &Task) -> Result<Vec<u8>, EncodingError> {
    if record.task_id != task.id {
        return Err(EncodingError::TaskMismatch { record: record.task_id, task: task.id });
    }
    let address = parse_address(&record.address)?;
    Ok(encode(&address, task.reward_amount, task.id).to_vec())
}

/// Parse a hex account address, with or without the `0x` prefix
pub fn parse_address(input: &str) -> Result<Address, EncodingError> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.len() != ADDRESS_LEN * 2 {
        return Err(EncodingError::InvalidAddress(format!(
            "{} (expected {} hex digits, got {})",
            input,
            ADDRESS_LEN * 2,
            digits.len()
        )));
    }

    let bytes = hex::decode(digits).map_err(|e| EncodingError::InvalidAddress(format!("{}: {}", input, e)))?;
    Ok(Address::from_slice(&bytes))
}

/// Lowercase `0x`-prefixed form under which records are stored and looked up
pub fn canonical_address(input: &str) -> Result<String, EncodingError> {
    let address = parse_address(input)?;
    Ok(format!("0x{}", hex::encode(address.as_bytes())))
}

/// Parse a decimal reward amount as stored in the task table.
///
/// NUMERIC columns may render a zero fractional part (`100.00000000`); any
/// other fraction, sign or overflow is rejected.
pub fn parse_reward(input: &str) -> Result<U256, EncodingError> {
    let trimmed = input.trim();
    let integer = match trimmed.split_once('.') {
        Some((int, frac)) if frac.chars().all(|c| c == '0') => int,
        Some(_) => return Err(EncodingError::ValueOutOfRange(format!("{} is not an integer amount", input))),
        None => trimmed,
    };

    if integer.is_empty() || !integer.chars().all(|c| c.is_ascii_digit()) {
        return Err(EncodingError::ValueOutOfRange(format!("{} is not a non-negative integer", input)));
    }

    U256::from_dec_str(integer).map_err(|e| EncodingError::ValueOutOfRange(format!("{}: {:?}", input, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER: &str = "0x4ffDe62cE898639329850eC872A5535F64cb8181";

    #[test]
    fn test_leaf_layout() {
        let address = parse_address(USER).unwrap();
        let leaf = encode(&address, U256::from(100u64), TaskId(1));

        assert_eq!(leaf.len(), 84);
        assert_eq!(&leaf[..20], address.as_bytes());
        // reward word: 31 zero bytes then 0x64
        assert!(leaf[20..51].iter().all(|b| *b == 0));
        assert_eq!(leaf[51], 100);
        // task id word
        assert!(leaf[52..83].iter().all(|b| *b == 0));
        assert_eq!(leaf[83], 1);
    }

    #[test]
    fn test_leaf_large_values_are_big_endian() {
        let address = Address::repeat_byte(0xaa);
        let reward = U256::from_dec_str("100000000000000000000").unwrap(); // 100 ether in wei
        let leaf = encode(&address, reward, TaskId(0x0102));

        let mut expected_reward = [0u8; 32];
        reward.to_big_endian(&mut expected_reward);
        assert_eq!(&leaf[20..52], &expected_reward);
        assert_eq!(&leaf[82..84], &[0x01, 0x02]);
    }

    #[test]
    fn test_distinct_triples_give_distinct_leaves() {
        let a = parse_address(USER).unwrap();
        let b = Address::repeat_byte(0x11);
        let base = encode(&a, U256::from(100u64), TaskId(1));

        assert_ne!(base, encode(&b, U256::from(100u64), TaskId(1)));
        assert_ne!(base, encode(&a, U256::from(101u64), TaskId(1)));
        assert_ne!(base, encode(&a, U256::from(100u64), TaskId(2)));
        assert_eq!(base, encode(&a, U256::from(100u64), TaskId(1)));
    }

    #[test]
    fn test_parse_address_variants() {
        let lower = parse_address(&USER.to_lowercase()).unwrap();
        let mixed = parse_address(USER).unwrap();
        let bare = parse_address(&USER[2..]).unwrap();
        assert_eq!(lower, mixed);
        assert_eq!(lower, bare);

        assert!(matches!(parse_address("0x1234"), Err(EncodingError::InvalidAddress(_))));
        assert!(matches!(
            parse_address("0xzzzDe62cE898639329850eC872A5535F64cb8181"),
            Err(EncodingError::InvalidAddress(_))
        ));
        assert!(parse_address("").is_err());
    }

    #[test]
    fn test_canonical_address_folds_case_and_prefix() {
        let expected = "0x4ffde62ce898639329850ec872a5535f64cb8181";
        assert_eq!(canonical_address(USER).unwrap(), expected);
        assert_eq!(canonical_address(&USER.to_uppercase().replacen("0X", "0x", 1)).unwrap(), expected);
        assert_eq!(canonical_address(&USER[2..]).unwrap(), expected);
        assert!(canonical_address("0xnot-an-address").is_err());
    }

    #[test]
    fn test_leaf_hash_matches_solidity_packed() {
        // ethers.keccak256(solidityPacked(["address","uint256","uint256"], [USER, parseEther("100"), 1]))
        let reward = U256::from_dec_str("100000000000000000000").unwrap();
        let leaf = encode(&parse_address(USER).unwrap(), reward, TaskId(1));
        assert_eq!(
            hex::encode(airdrop_common::keccak256(&leaf)),
            "e9780d77a173ea022a48cf8237b5d8f18f4e1da561675edc25cae94e3df951ae"
        );
    }

    #[test]
    fn test_encode_record_checks_task() {
        let task = Task::new(TaskId(5), "follow", U256::from(10u64));
        let record = UserTaskRecord::claim("u1", USER, TaskId(5));
        assert_eq!(encode_record(&record, &task).unwrap().len(), LEAF_LEN);

        let other = UserTaskRecord::claim("u1", USER, TaskId(6));
        assert_eq!(
            encode_record(&other, &task),
            Err(EncodingError::TaskMismatch { record: TaskId(6), task: TaskId(5) })
        );

        let broken = UserTaskRecord::claim("u2", "not-an-address", TaskId(5));
        assert!(matches!(encode_record(&broken, &task), Err(EncodingError::InvalidAddress(_))));
    }

    #[test]
    fn test_parse_reward() {
        assert_eq!(parse_reward("100").unwrap(), U256::from(100u64));
        assert_eq!(parse_reward("100.00000000").unwrap(), U256::from(100u64));
        assert!(parse_reward("100.5").is_err());
        assert!(parse_reward("-1").is_err());
        assert!(parse_reward("").is_err());
        // 2^256 overflows
        assert!(parse_reward(
            "115792089237316195423570985008687907853269984665640564039457584007913129639936"
        )
        .is_err());
    }
}
