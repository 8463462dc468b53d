//! Heuristic bytecode analysis
//!
//! Pattern matchers over raw runtime bytecode. None of this is a proof:
//! PUSH immediates are skipped while walking opcodes, but data sections,
//! metadata trailers and unreachable code are scanned like any other
//! bytes, so every flag and count here is approximate.

use crate::records::{ContractAnalysis, ANALYSIS_SCHEMA_VERSION};
use alloy_primitives::{Address, B256};
use std::collections::HashSet;

const OP_EQ: u8 = 0x14;
const OP_ISZERO: u8 = 0x15;
const OP_CALLDATASIZE: u8 = 0x36;
const OP_JUMPI: u8 = 0x57;
const OP_PUSH1: u8 = 0x60;
const OP_PUSH2: u8 = 0x61;
const OP_PUSH4: u8 = 0x63;
const OP_PUSH32: u8 = 0x7f;
const OP_CREATE: u8 = 0xf0;
const OP_CREATE2: u8 = 0xf5;
const OP_LT: u8 = 0x10;

/// EIP-1167 minimal proxy: code before the 20-byte implementation address.
const EIP1167_PREFIX: [u8; 10] = [0x36, 0x3d, 0x3d, 0x37, 0x3d, 0x3d, 0x3d, 0x36, 0x3d, 0x73];
/// EIP-1167 minimal proxy: code after the implementation address.
const EIP1167_SUFFIX: [u8; 15] = [
    0x5a, 0xf4, 0x3d, 0x82, 0x80, 0x3e, 0x90, 0x3d, 0x91, 0x60, 0x2b, 0x57, 0xfd, 0x5b, 0xf3,
];
/// Vyper / 0age "optimized" minimal proxy prefix, followed by PUSH20 <impl>.
const OPTIMIZED_PROXY_PREFIX: [u8; 9] = [0x3d, 0x3d, 0x3d, 0x3d, 0x36, 0x3d, 0x3d, 0x37, 0x36];

/// One decoded instruction and its PUSH immediate (empty for other opcodes).
#[derive(Debug, Clone, Copy)]
struct Instruction<'a> {
    op: u8,
    immediate: &'a [u8],
}

/// Walk opcodes, skipping PUSH immediates. A truncated final PUSH yields
/// a short immediate.
fn instructions(code: &[u8]) -> impl Iterator<Item = Instruction<'_>> {
    let mut pc = 0usize;
    std::iter::from_fn(move || {
        if pc >= code.len() {
            return None;
        }
        let op = code[pc];
        let width = if (OP_PUSH1..=OP_PUSH32).contains(&op) {
            (op - OP_PUSH1 + 1) as usize
        } else {
            0
        };
        let start = (pc + 1).min(code.len());
        let end = (pc + 1 + width).min(code.len());
        pc += 1 + width;
        Some(Instruction {
            op,
            immediate: &code[start..end],
        })
    })
}

/// Implementation address of a minimal proxy, if `code` is one.
pub fn minimal_proxy_target(code: &[u8]) -> Option<Address> {
    if code.len() == EIP1167_PREFIX.len() + 20 + EIP1167_SUFFIX.len()
        && code.starts_with(&EIP1167_PREFIX)
        && code.ends_with(&EIP1167_SUFFIX)
    {
        let start = EIP1167_PREFIX.len();
        return Some(Address::from_slice(&code[start..start + 20]));
    }

    if code.starts_with(&OPTIMIZED_PROXY_PREFIX) {
        // 0x73 = PUSH20 somewhere in the next few bytes
        let from = OPTIMIZED_PROXY_PREFIX.len();
        let window = &code[from..code.len().min(from + 8)];
        if let Some(offset) = window.iter().position(|b| *b == 0x73) {
            let start = from + offset + 1;
            if code.len() >= start + 20 {
                return Some(Address::from_slice(&code[start..start + 20]));
            }
        }
    }
    None
}

/// Whether the bytecode contains a CREATE or CREATE2 opcode.
pub fn has_create_opcode(code: &[u8]) -> bool {
    instructions(code).any(|i| i.op == OP_CREATE || i.op == OP_CREATE2)
}

/// Count distinct 4-byte selectors compared in a dispatcher (`PUSH4 sel EQ`).
pub fn count_selectors(code: &[u8]) -> u32 {
    let ops: Vec<Instruction<'_>> = instructions(code).collect();
    let selectors: HashSet<&[u8]> = ops
        .windows(2)
        .filter(|w| w[0].op == OP_PUSH4 && w[0].immediate.len() == 4 && w[1].op == OP_EQ)
        .map(|w| w[0].immediate)
        .collect();
    selectors.len() as u32
}

/// Count distinct non-zero PUSH32 constants. Event topics are pushed this
/// way, though so are other 32-byte constants.
pub fn count_event_topics(code: &[u8]) -> u32 {
    let topics: HashSet<&[u8]> = instructions(code)
        .filter(|i| i.op == OP_PUSH32 && i.immediate.len() == 32)
        .map(|i| i.immediate)
        .filter(|imm| imm.iter().any(|b| *b != 0))
        .collect();
    topics.len() as u32
}

/// `PUSH1 0x04 CALLDATASIZE LT ... JUMPI`: calldata shorter than a selector
/// is routed away from the dispatcher, which is how Solidity reaches a
/// fallback or receive function.
pub fn has_fallback_prologue(code: &[u8]) -> bool {
    let ops: Vec<Instruction<'_>> = instructions(code).take(64).collect();
    ops.windows(4).any(|w| {
        w[0].op == OP_PUSH1
            && w[0].immediate == [0x04u8]
            && w[1].op == OP_CALLDATASIZE
            && w[2].op == OP_LT
            && (w[3].op == OP_JUMPI || w[3].op == OP_PUSH2)
    })
}

/// `CALLDATASIZE ISZERO`: an explicit empty-calldata branch, typical of `receive()`.
pub fn has_receive_prologue(code: &[u8]) -> bool {
    let ops: Vec<Instruction<'_>> = instructions(code).collect();
    ops.windows(2)
        .any(|w| w[0].op == OP_CALLDATASIZE && w[1].op == OP_ISZERO)
}

/// Run every matcher over `code`.
pub fn analyze_bytecode(
    network: &str,
    address: Address,
    fingerprint: B256,
    code: &[u8],
) -> ContractAnalysis {
    let proxy_implementation = minimal_proxy_target(code);
    ContractAnalysis {
        schema_version: ANALYSIS_SCHEMA_VERSION,
        address,
        network: network.to_string(),
        fingerprint,
        is_proxy: proxy_implementation.is_some(),
        proxy_implementation,
        is_factory: has_create_opcode(code),
        has_fallback: has_fallback_prologue(code),
        has_receive: has_receive_prologue(code),
        selector_count: count_selectors(code),
        event_topic_count: count_event_topics(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    fn eip1167(target: Address) -> Vec<u8> {
        let mut code = EIP1167_PREFIX.to_vec();
        code.extend_from_slice(target.as_slice());
        code.extend_from_slice(&EIP1167_SUFFIX);
        code
    }

    #[test]
    fn test_minimal_proxy_detected() {
        let target = address!("bebebebebebebebebebebebebebebebebebebebe");
        let code = eip1167(target);
        assert_eq!(code.len(), 45);
        assert_eq!(minimal_proxy_target(&code), Some(target));

        let analysis = analyze_bytecode("mainnet", Address::ZERO, B256::ZERO, &code);
        assert!(analysis.is_proxy);
        assert_eq!(analysis.proxy_implementation, Some(target));
        assert_eq!(analysis.schema_version, ANALYSIS_SCHEMA_VERSION);
    }

    #[test]
    fn test_truncated_proxy_not_detected() {
        let code = eip1167(Address::ZERO);
        assert_eq!(minimal_proxy_target(&code[..40]), None);
    }

    #[test]
    fn test_create_opcode_ignores_push_data() {
        // PUSH2 0xf0f5 STOP: the CREATE bytes are immediates, not opcodes
        assert!(!has_create_opcode(&[0x61, 0xf0, 0xf5, 0x00]));
        // PUSH1 0 DUP1 DUP1 CREATE2
        assert!(has_create_opcode(&[0x60, 0x00, 0x80, 0x80, 0xf5]));
        assert!(has_create_opcode(&[0xf0]));
    }

    #[test]
    fn test_selector_count() {
        let mut code = Vec::new();
        for sel in [[0xa9, 0x05, 0x9c, 0xbb], [0x09, 0x5e, 0xa7, 0xb3], [0xa9, 0x05, 0x9c, 0xbb]] {
            code.push(0x80); // DUP1
            code.push(OP_PUSH4);
            code.extend_from_slice(&sel);
            code.push(OP_EQ);
        }
        // A PUSH4 not followed by EQ does not count
        code.extend_from_slice(&[OP_PUSH4, 1, 2, 3, 4, 0x50]);
        assert_eq!(count_selectors(&code), 2);
    }

    #[test]
    fn test_event_topic_count() {
        let mut code = vec![OP_PUSH32];
        code.extend_from_slice(&[0xdd; 32]);
        code.push(OP_PUSH32);
        code.extend_from_slice(&[0x00; 32]);
        code.push(OP_PUSH32);
        code.extend_from_slice(&[0xdd; 32]);
        assert_eq!(count_event_topics(&code), 1);
    }

    #[test]
    fn test_prologues() {
        // PUSH1 0x04 CALLDATASIZE LT PUSH2 0x0041 JUMPI
        let fallback = [0x60, 0x04, 0x36, 0x10, 0x61, 0x00, 0x41, 0x57];
        assert!(has_fallback_prologue(&fallback));
        assert!(!has_receive_prologue(&fallback));

        // CALLDATASIZE ISZERO PUSH1 0x20 JUMPI
        let receive = [0x36, 0x15, 0x60, 0x20, 0x57];
        assert!(has_receive_prologue(&receive));
        assert!(!has_fallback_prologue(&receive));
    }

    #[test]
    fn test_empty_code() {
        let analysis = analyze_bytecode("mainnet", Address::ZERO, B256::ZERO, &[]);
        assert!(!analysis.is_proxy);
        assert!(!analysis.is_factory);
        assert_eq!(analysis.selector_count, 0);
        assert_eq!(analysis.event_topic_count, 0);
    }
}
