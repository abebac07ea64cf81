//! Shared fixtures for the integration tests.
//!
//! The suite runs against a real device; [`manager`] returns `None` (and the
//! test skips) when no Vulkan implementation is available, so the tests pass
//! on driverless CI machines.
//!
//! Test shaders are assembled in-process as SPIR-V word streams and written
//! to a per-process temp directory, since tasks are created from shader
//! files.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use scoria::JobManager;

static PROBED: AtomicBool = AtomicBool::new(false);

pub fn manager() -> Option<JobManager> {
    let _ = tracing_subscriber::fmt::try_init();
    match JobManager::new() {
        Ok(manager) => Some(manager),
        Err(e) => {
            if !PROBED.swap(true, Ordering::Relaxed) {
                eprintln!("skipping device tests: {e}");
            }
            None
        }
    }
}

/// Writes `words` as a little-endian SPIR-V binary under the test temp dir
/// and returns its path.
pub fn write_shader(name: &str, words: &[u32]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("scoria-tests-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    std::fs::write(&path, bytes).unwrap();
    path
}

// SPIR-V opcodes used by the assembled modules.
const OP_CAPABILITY: u16 = 17;
const OP_MEMORY_MODEL: u16 = 14;
const OP_ENTRY_POINT: u16 = 15;
const OP_EXECUTION_MODE: u16 = 16;
const OP_TYPE_VOID: u16 = 19;
const OP_TYPE_INT: u16 = 21;
const OP_TYPE_VECTOR: u16 = 23;
const OP_TYPE_RUNTIME_ARRAY: u16 = 29;
const OP_TYPE_STRUCT: u16 = 30;
const OP_TYPE_POINTER: u16 = 32;
const OP_TYPE_FUNCTION: u16 = 33;
const OP_CONSTANT: u16 = 43;
const OP_SPEC_CONSTANT: u16 = 50;
const OP_FUNCTION: u16 = 54;
const OP_FUNCTION_END: u16 = 56;
const OP_VARIABLE: u16 = 59;
const OP_LOAD: u16 = 61;
const OP_STORE: u16 = 62;
const OP_ACCESS_CHAIN: u16 = 65;
const OP_DECORATE: u16 = 71;
const OP_MEMBER_DECORATE: u16 = 72;
const OP_COMPOSITE_EXTRACT: u16 = 81;
const OP_IADD: u16 = 128;
const OP_LABEL: u16 = 248;
const OP_RETURN: u16 = 253;

const CAP_SHADER: u32 = 1;
const ADDRESSING_LOGICAL: u32 = 0;
const MEMORY_MODEL_GLSL450: u32 = 1;
const EXECUTION_MODEL_GL_COMPUTE: u32 = 5;
const EXECUTION_MODE_LOCAL_SIZE: u32 = 17;

const DECORATION_SPEC_ID: u32 = 1;
const DECORATION_BLOCK: u32 = 2;
const DECORATION_BUFFER_BLOCK: u32 = 3;
const DECORATION_ARRAY_STRIDE: u32 = 6;
const DECORATION_BUILT_IN: u32 = 11;
const DECORATION_NON_WRITABLE: u32 = 24;
const DECORATION_BINDING: u32 = 33;
const DECORATION_DESCRIPTOR_SET: u32 = 34;
const DECORATION_OFFSET: u32 = 35;
const BUILT_IN_GLOBAL_INVOCATION_ID: u32 = 28;

const STORAGE_CLASS_INPUT: u32 = 1;
const STORAGE_CLASS_UNIFORM: u32 = 2;
const STORAGE_CLASS_PUSH_CONSTANT: u32 = 9;

fn inst(opcode: u16, operands: &[u32]) -> Vec<u32> {
    let mut words = vec![((operands.len() as u32 + 1) << 16) | opcode as u32];
    words.extend_from_slice(operands);
    words
}

fn string_words(s: &str) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
        .chunks(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn assemble(bound: u32, instructions: &[Vec<u32>]) -> Vec<u32> {
    let mut words = vec![0x0723_0203, 0x0001_0000, 0, bound, 0];
    for instruction in instructions {
        words.extend_from_slice(instruction);
    }
    words
}

fn entry_point(main: u32, interface: &[u32]) -> Vec<u32> {
    let mut operands = vec![EXECUTION_MODEL_GL_COMPUTE, main];
    operands.extend(string_words("main"));
    operands.extend_from_slice(interface);
    inst(OP_ENTRY_POINT, &operands)
}

/// `b[i] = a[i] + b[i]` with `a` read-only at (set 0, binding 0) and `b`
/// read-write at (set 0, binding 1), local size 1.
pub fn sum_shader() -> Vec<u32> {
    // ids
    let (void, fnty, uint, v3uint, ptr_in_v3, gid) = (1, 2, 3, 4, 5, 6);
    let (rarr, block_a, block_b, ptr_a, ptr_b, var_a, var_b) = (7, 8, 9, 10, 11, 12, 13);
    let (uint0, ptr_u_uint, main, label) = (14, 15, 16, 17);
    let (gidval, idx, pa, va, pb, vb, sum) = (18, 19, 20, 21, 22, 23, 24);
    assemble(
        32,
        &[
            inst(OP_CAPABILITY, &[CAP_SHADER]),
            inst(OP_MEMORY_MODEL, &[ADDRESSING_LOGICAL, MEMORY_MODEL_GLSL450]),
            entry_point(main, &[gid]),
            inst(OP_EXECUTION_MODE, &[main, EXECUTION_MODE_LOCAL_SIZE, 1, 1, 1]),
            inst(OP_DECORATE, &[gid, DECORATION_BUILT_IN, BUILT_IN_GLOBAL_INVOCATION_ID]),
            inst(OP_DECORATE, &[rarr, DECORATION_ARRAY_STRIDE, 4]),
            inst(OP_DECORATE, &[block_a, DECORATION_BUFFER_BLOCK]),
            inst(OP_MEMBER_DECORATE, &[block_a, 0, DECORATION_OFFSET, 0]),
            inst(OP_MEMBER_DECORATE, &[block_a, 0, DECORATION_NON_WRITABLE]),
            inst(OP_DECORATE, &[var_a, DECORATION_DESCRIPTOR_SET, 0]),
            inst(OP_DECORATE, &[var_a, DECORATION_BINDING, 0]),
            inst(OP_DECORATE, &[block_b, DECORATION_BUFFER_BLOCK]),
            inst(OP_MEMBER_DECORATE, &[block_b, 0, DECORATION_OFFSET, 0]),
            inst(OP_DECORATE, &[var_b, DECORATION_DESCRIPTOR_SET, 0]),
            inst(OP_DECORATE, &[var_b, DECORATION_BINDING, 1]),
            inst(OP_TYPE_VOID, &[void]),
            inst(OP_TYPE_FUNCTION, &[fnty, void]),
            inst(OP_TYPE_INT, &[uint, 32, 0]),
            inst(OP_TYPE_VECTOR, &[v3uint, uint, 3]),
            inst(OP_TYPE_POINTER, &[ptr_in_v3, STORAGE_CLASS_INPUT, v3uint]),
            inst(OP_VARIABLE, &[ptr_in_v3, gid, STORAGE_CLASS_INPUT]),
            inst(OP_TYPE_RUNTIME_ARRAY, &[rarr, uint]),
            inst(OP_TYPE_STRUCT, &[block_a, rarr]),
            inst(OP_TYPE_STRUCT, &[block_b, rarr]),
            inst(OP_TYPE_POINTER, &[ptr_a, STORAGE_CLASS_UNIFORM, block_a]),
            inst(OP_TYPE_POINTER, &[ptr_b, STORAGE_CLASS_UNIFORM, block_b]),
            inst(OP_VARIABLE, &[ptr_a, var_a, STORAGE_CLASS_UNIFORM]),
            inst(OP_VARIABLE, &[ptr_b, var_b, STORAGE_CLASS_UNIFORM]),
            inst(OP_CONSTANT, &[uint, uint0, 0]),
            inst(OP_TYPE_POINTER, &[ptr_u_uint, STORAGE_CLASS_UNIFORM, uint]),
            inst(OP_FUNCTION, &[void, main, 0, fnty]),
            inst(OP_LABEL, &[label]),
            inst(OP_LOAD, &[v3uint, gidval, gid]),
            inst(OP_COMPOSITE_EXTRACT, &[uint, idx, gidval, 0]),
            inst(OP_ACCESS_CHAIN, &[ptr_u_uint, pa, var_a, uint0, idx]),
            inst(OP_LOAD, &[uint, va, pa]),
            inst(OP_ACCESS_CHAIN, &[ptr_u_uint, pb, var_b, uint0, idx]),
            inst(OP_LOAD, &[uint, vb, pb]),
            inst(OP_IADD, &[uint, sum, va, vb]),
            inst(OP_STORE, &[pb, sum]),
            inst(OP_RETURN, &[]),
            inst(OP_FUNCTION_END, &[]),
        ],
    )
}

/// `b[i] = C` where `C` is specialization constant 0 (default 0); `b` is
/// read-write at (set 0, binding 0).
pub fn fill_spec_shader() -> Vec<u32> {
    let (void, fnty, uint, v3uint, ptr_in_v3, gid) = (1, 2, 3, 4, 5, 6);
    let (rarr, block, ptr_block, var_b, uint0, ptr_u_uint, spec) = (7, 8, 9, 10, 11, 12, 13);
    let (main, label, gidval, idx, pb) = (14, 15, 16, 17, 18);
    assemble(
        24,
        &[
            inst(OP_CAPABILITY, &[CAP_SHADER]),
            inst(OP_MEMORY_MODEL, &[ADDRESSING_LOGICAL, MEMORY_MODEL_GLSL450]),
            entry_point(main, &[gid]),
            inst(OP_EXECUTION_MODE, &[main, EXECUTION_MODE_LOCAL_SIZE, 1, 1, 1]),
            inst(OP_DECORATE, &[gid, DECORATION_BUILT_IN, BUILT_IN_GLOBAL_INVOCATION_ID]),
            inst(OP_DECORATE, &[spec, DECORATION_SPEC_ID, 0]),
            inst(OP_DECORATE, &[rarr, DECORATION_ARRAY_STRIDE, 4]),
            inst(OP_DECORATE, &[block, DECORATION_BUFFER_BLOCK]),
            inst(OP_MEMBER_DECORATE, &[block, 0, DECORATION_OFFSET, 0]),
            inst(OP_DECORATE, &[var_b, DECORATION_DESCRIPTOR_SET, 0]),
            inst(OP_DECORATE, &[var_b, DECORATION_BINDING, 0]),
            inst(OP_TYPE_VOID, &[void]),
            inst(OP_TYPE_FUNCTION, &[fnty, void]),
            inst(OP_TYPE_INT, &[uint, 32, 0]),
            inst(OP_TYPE_VECTOR, &[v3uint, uint, 3]),
            inst(OP_TYPE_POINTER, &[ptr_in_v3, STORAGE_CLASS_INPUT, v3uint]),
            inst(OP_VARIABLE, &[ptr_in_v3, gid, STORAGE_CLASS_INPUT]),
            inst(OP_TYPE_RUNTIME_ARRAY, &[rarr, uint]),
            inst(OP_TYPE_STRUCT, &[block, rarr]),
            inst(OP_TYPE_POINTER, &[ptr_block, STORAGE_CLASS_UNIFORM, block]),
            inst(OP_VARIABLE, &[ptr_block, var_b, STORAGE_CLASS_UNIFORM]),
            inst(OP_CONSTANT, &[uint, uint0, 0]),
            inst(OP_TYPE_POINTER, &[ptr_u_uint, STORAGE_CLASS_UNIFORM, uint]),
            inst(OP_SPEC_CONSTANT, &[uint, spec, 0]),
            inst(OP_FUNCTION, &[void, main, 0, fnty]),
            inst(OP_LABEL, &[label]),
            inst(OP_LOAD, &[v3uint, gidval, gid]),
            inst(OP_COMPOSITE_EXTRACT, &[uint, idx, gidval, 0]),
            inst(OP_ACCESS_CHAIN, &[ptr_u_uint, pb, var_b, uint0, idx]),
            inst(OP_STORE, &[pb, spec]),
            inst(OP_RETURN, &[]),
            inst(OP_FUNCTION_END, &[]),
        ],
    )
}

/// `b[i] = b[i] + pc.value` with a 4-byte push-constant block; `b` is
/// read-write at (set 0, binding 0).
pub fn add_push_constant_shader() -> Vec<u32> {
    let (void, fnty, uint, v3uint, ptr_in_v3, gid) = (1, 2, 3, 4, 5, 6);
    let (rarr, block_b, ptr_b, var_b, uint0, ptr_u_uint) = (7, 8, 9, 10, 11, 12);
    let (pc_block, ptr_pc_block, var_pc, ptr_pc_uint) = (13, 14, 15, 16);
    let (main, label, gidval, idx, ppc, vpc, pb, vb, sum) = (17, 18, 19, 20, 21, 22, 23, 24, 25);
    assemble(
        32,
        &[
            inst(OP_CAPABILITY, &[CAP_SHADER]),
            inst(OP_MEMORY_MODEL, &[ADDRESSING_LOGICAL, MEMORY_MODEL_GLSL450]),
            entry_point(main, &[gid]),
            inst(OP_EXECUTION_MODE, &[main, EXECUTION_MODE_LOCAL_SIZE, 1, 1, 1]),
            inst(OP_DECORATE, &[gid, DECORATION_BUILT_IN, BUILT_IN_GLOBAL_INVOCATION_ID]),
            inst(OP_DECORATE, &[rarr, DECORATION_ARRAY_STRIDE, 4]),
            inst(OP_DECORATE, &[block_b, DECORATION_BUFFER_BLOCK]),
            inst(OP_MEMBER_DECORATE, &[block_b, 0, DECORATION_OFFSET, 0]),
            inst(OP_DECORATE, &[var_b, DECORATION_DESCRIPTOR_SET, 0]),
            inst(OP_DECORATE, &[var_b, DECORATION_BINDING, 0]),
            inst(OP_DECORATE, &[pc_block, DECORATION_BLOCK]),
            inst(OP_MEMBER_DECORATE, &[pc_block, 0, DECORATION_OFFSET, 0]),
            inst(OP_TYPE_VOID, &[void]),
            inst(OP_TYPE_FUNCTION, &[fnty, void]),
            inst(OP_TYPE_INT, &[uint, 32, 0]),
            inst(OP_TYPE_VECTOR, &[v3uint, uint, 3]),
            inst(OP_TYPE_POINTER, &[ptr_in_v3, STORAGE_CLASS_INPUT, v3uint]),
            inst(OP_VARIABLE, &[ptr_in_v3, gid, STORAGE_CLASS_INPUT]),
            inst(OP_TYPE_RUNTIME_ARRAY, &[rarr, uint]),
            inst(OP_TYPE_STRUCT, &[block_b, rarr]),
            inst(OP_TYPE_POINTER, &[ptr_b, STORAGE_CLASS_UNIFORM, block_b]),
            inst(OP_VARIABLE, &[ptr_b, var_b, STORAGE_CLASS_UNIFORM]),
            inst(OP_CONSTANT, &[uint, uint0, 0]),
            inst(OP_TYPE_POINTER, &[ptr_u_uint, STORAGE_CLASS_UNIFORM, uint]),
            inst(OP_TYPE_STRUCT, &[pc_block, uint]),
            inst(OP_TYPE_POINTER, &[ptr_pc_block, STORAGE_CLASS_PUSH_CONSTANT, pc_block]),
            inst(OP_VARIABLE, &[ptr_pc_block, var_pc, STORAGE_CLASS_PUSH_CONSTANT]),
            inst(OP_TYPE_POINTER, &[ptr_pc_uint, STORAGE_CLASS_PUSH_CONSTANT, uint]),
            inst(OP_FUNCTION, &[void, main, 0, fnty]),
            inst(OP_LABEL, &[label]),
            inst(OP_LOAD, &[v3uint, gidval, gid]),
            inst(OP_COMPOSITE_EXTRACT, &[uint, idx, gidval, 0]),
            inst(OP_ACCESS_CHAIN, &[ptr_pc_uint, ppc, var_pc, uint0]),
            inst(OP_LOAD, &[uint, vpc, ppc]),
            inst(OP_ACCESS_CHAIN, &[ptr_u_uint, pb, var_b, uint0, idx]),
            inst(OP_LOAD, &[uint, vb, pb]),
            inst(OP_IADD, &[uint, sum, vb, vpc]),
            inst(OP_STORE, &[pb, sum]),
            inst(OP_RETURN, &[]),
            inst(OP_FUNCTION_END, &[]),
        ],
    )
}
