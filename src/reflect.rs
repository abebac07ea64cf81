//! SPIR-V shader reflection.
//!
//! Compute modules arrive as compiled SPIR-V; this module parses the word
//! stream directly to recover what the job system needs to drive descriptor
//! layouts and dependency tracking:
//!
//! - per-set, per-binding descriptor kinds (storage buffers and storage
//!   images only),
//! - per-binding access flags: [`AccessFlags::NONE`] for bindings never
//!   referenced by the entry function, read-only for `NonWritable` bindings,
//!   read-write otherwise,
//! - the size of the (single) push-constant block, 0 if absent.
//!
//! Both the modern `StorageBuffer` storage class with `Block` decoration and
//! the legacy `Uniform` + `BufferBlock` form are recognized.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::resource::DescriptorKind;
use crate::tracking::AccessFlags;

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

const OP_TYPE_BOOL: u16 = 20;
const OP_TYPE_INT: u16 = 21;
const OP_TYPE_FLOAT: u16 = 22;
const OP_TYPE_VECTOR: u16 = 23;
const OP_TYPE_MATRIX: u16 = 24;
const OP_TYPE_IMAGE: u16 = 25;
const OP_TYPE_SAMPLER: u16 = 26;
const OP_TYPE_SAMPLED_IMAGE: u16 = 27;
const OP_TYPE_ARRAY: u16 = 28;
const OP_TYPE_RUNTIME_ARRAY: u16 = 29;
const OP_TYPE_STRUCT: u16 = 30;
const OP_TYPE_POINTER: u16 = 32;
const OP_CONSTANT: u16 = 43;
const OP_FUNCTION: u16 = 54;
const OP_FUNCTION_CALL: u16 = 57;
const OP_VARIABLE: u16 = 59;
const OP_IMAGE_TEXEL_POINTER: u16 = 60;
const OP_LOAD: u16 = 61;
const OP_STORE: u16 = 62;
const OP_COPY_MEMORY: u16 = 63;
const OP_ACCESS_CHAIN: u16 = 65;
const OP_IN_BOUNDS_ACCESS_CHAIN: u16 = 66;
const OP_DECORATE: u16 = 71;
const OP_MEMBER_DECORATE: u16 = 72;
const OP_ATOMIC_LOAD: u16 = 227;
const OP_ATOMIC_STORE: u16 = 228;
const OP_ATOMIC_FIRST_RMW: u16 = 229;
const OP_ATOMIC_LAST_RMW: u16 = 242;

const DECORATION_BUFFER_BLOCK: u32 = 3;
const DECORATION_ARRAY_STRIDE: u32 = 6;
const DECORATION_NON_WRITABLE: u32 = 24;
const DECORATION_BINDING: u32 = 33;
const DECORATION_DESCRIPTOR_SET: u32 = 34;
const DECORATION_OFFSET: u32 = 35;

const STORAGE_CLASS_UNIFORM_CONSTANT: u32 = 0;
const STORAGE_CLASS_UNIFORM: u32 = 2;
const STORAGE_CLASS_PUSH_CONSTANT: u32 = 9;
const STORAGE_CLASS_STORAGE_BUFFER: u32 = 12;

/// Reflection output for one compute module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderInfo {
    /// Outer index is the descriptor set, inner index the binding slot.
    pub set_layouts: Vec<Vec<DescriptorKind>>,
    /// Same shape as `set_layouts`.
    pub access_flags: Vec<Vec<AccessFlags>>,
    /// Size in bytes of the push-constant block, 0 if the module has none.
    pub push_constant_size: u32,
}

/// Reinterprets raw shader bytes as a SPIR-V word stream.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::ShaderReflect(
            "bytecode length is not a multiple of 4".into(),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[derive(Debug, Clone, Copy)]
enum Type {
    Bool,
    Int { width: u32 },
    Float { width: u32 },
    Vector { component: u32, count: u32 },
    Matrix { column: u32, count: u32 },
    Array { element: u32, length_id: u32 },
    RuntimeArray,
    Struct,
    Image,
    Sampler,
    SampledImage,
    Pointer { storage_class: u32, pointee: u32 },
}

#[derive(Debug, Default, Clone, Copy)]
struct Decorations {
    set: Option<u32>,
    binding: Option<u32>,
    non_writable: bool,
    buffer_block: bool,
    array_stride: Option<u32>,
}

struct Variable {
    id: u32,
    pointer_type: u32,
    storage_class: u32,
}

#[derive(Default)]
struct Module {
    types: HashMap<u32, Type>,
    struct_members: HashMap<u32, Vec<u32>>,
    constants: HashMap<u32, u32>,
    decorations: HashMap<u32, Decorations>,
    member_offsets: HashMap<u32, HashMap<u32, u32>>,
    member_non_writable: HashMap<u32, HashSet<u32>>,
    variables: Vec<Variable>,
    /// Pointer-producing instruction results mapped to their base pointer.
    chain_bases: HashMap<u32, u32>,
    /// Pointers directly loaded, stored, or passed to a callee.
    referenced: HashSet<u32>,
}

/// Reflects a compute module from its word stream.
pub fn reflect(words: &[u32]) -> Result<ShaderInfo> {
    let module = parse(words)?;

    let used = module.used_roots();
    let mut bindings: Vec<(u32, u32, DescriptorKind, AccessFlags)> = Vec::new();
    let mut push_constant_size = 0u32;

    for var in &module.variables {
        let pointee = match module.types.get(&var.pointer_type) {
            Some(Type::Pointer { pointee, .. }) => *pointee,
            _ => continue,
        };
        let kind = match var.storage_class {
            STORAGE_CLASS_STORAGE_BUFFER => DescriptorKind::StorageBuffer,
            STORAGE_CLASS_UNIFORM => {
                let decorations = module.decoration(pointee);
                if decorations.buffer_block {
                    DescriptorKind::StorageBuffer
                } else {
                    return Err(Error::ShaderReflect(
                        "uniform-buffer descriptors are not supported".into(),
                    ));
                }
            }
            STORAGE_CLASS_UNIFORM_CONSTANT => match module.types.get(&pointee) {
                Some(Type::Image) => DescriptorKind::StorageImage,
                Some(Type::SampledImage) | Some(Type::Sampler) => {
                    return Err(Error::ShaderReflect(
                        "sampled-image and sampler descriptors are not supported".into(),
                    ));
                }
                _ => {
                    return Err(Error::ShaderReflect(format!(
                        "unsupported descriptor for variable %{}",
                        var.id
                    )));
                }
            },
            STORAGE_CLASS_PUSH_CONSTANT => {
                if push_constant_size == 0 {
                    push_constant_size = module.type_size(pointee)?;
                }
                continue;
            }
            _ => continue,
        };

        let decorations = module.decoration(var.id);
        let set = decorations.set.unwrap_or(0);
        let binding = decorations.binding.unwrap_or(0);
        let access = if !used.contains(&var.id) {
            AccessFlags::NONE
        } else if module.is_non_writable(var.id, pointee) {
            AccessFlags::READ
        } else {
            AccessFlags::READ | AccessFlags::WRITE
        };
        bindings.push((set, binding, kind, access));
    }

    let set_count = bindings
        .iter()
        .map(|&(set, ..)| set as usize + 1)
        .max()
        .unwrap_or(0);
    let mut set_layouts = vec![Vec::new(); set_count];
    let mut access_flags = vec![Vec::new(); set_count];

    bindings.sort_by_key(|&(set, binding, ..)| (set, binding));
    for (set, binding, kind, access) in bindings {
        let layout = &mut set_layouts[set as usize];
        if binding as usize != layout.len() {
            return Err(Error::ShaderReflect(format!(
                "set {set} bindings are not contiguous from zero"
            )));
        }
        layout.push(kind);
        access_flags[set as usize].push(access);
    }

    Ok(ShaderInfo {
        set_layouts,
        access_flags,
        push_constant_size,
    })
}

fn parse(words: &[u32]) -> Result<Module> {
    if words.len() < 5 {
        return Err(Error::ShaderReflect("bytecode is truncated".into()));
    }
    if words[0] != SPIRV_MAGIC {
        return Err(Error::ShaderReflect(format!(
            "bad magic number {:#010x}",
            words[0]
        )));
    }

    let mut module = Module::default();
    let mut in_function_section = false;
    let mut cursor = 5;
    while cursor < words.len() {
        let word = words[cursor];
        let opcode = (word & 0xffff) as u16;
        let count = (word >> 16) as usize;
        if count == 0 || cursor + count > words.len() {
            return Err(Error::ShaderReflect(format!(
                "malformed instruction at word {cursor}"
            )));
        }
        let operands = &words[cursor + 1..cursor + count];
        cursor += count;

        match opcode {
            OP_DECORATE if operands.len() >= 2 => {
                let entry = module.decorations.entry(operands[0]).or_default();
                match operands[1] {
                    DECORATION_DESCRIPTOR_SET => entry.set = operands.get(2).copied(),
                    DECORATION_BINDING => entry.binding = operands.get(2).copied(),
                    DECORATION_NON_WRITABLE => entry.non_writable = true,
                    DECORATION_BUFFER_BLOCK => entry.buffer_block = true,
                    DECORATION_ARRAY_STRIDE => entry.array_stride = operands.get(2).copied(),
                    _ => {}
                }
            }
            OP_MEMBER_DECORATE if operands.len() >= 3 => match operands[2] {
                DECORATION_OFFSET => {
                    if let Some(&offset) = operands.get(3) {
                        module
                            .member_offsets
                            .entry(operands[0])
                            .or_default()
                            .insert(operands[1], offset);
                    }
                }
                DECORATION_NON_WRITABLE => {
                    module
                        .member_non_writable
                        .entry(operands[0])
                        .or_default()
                        .insert(operands[1]);
                }
                _ => {}
            },
            OP_TYPE_BOOL if !operands.is_empty() => {
                module.types.insert(operands[0], Type::Bool);
            }
            OP_TYPE_INT if operands.len() >= 2 => {
                module
                    .types
                    .insert(operands[0], Type::Int { width: operands[1] });
            }
            OP_TYPE_FLOAT if operands.len() >= 2 => {
                module
                    .types
                    .insert(operands[0], Type::Float { width: operands[1] });
            }
            OP_TYPE_VECTOR if operands.len() >= 3 => {
                module.types.insert(
                    operands[0],
                    Type::Vector {
                        component: operands[1],
                        count: operands[2],
                    },
                );
            }
            OP_TYPE_MATRIX if operands.len() >= 3 => {
                module.types.insert(
                    operands[0],
                    Type::Matrix {
                        column: operands[1],
                        count: operands[2],
                    },
                );
            }
            OP_TYPE_IMAGE if !operands.is_empty() => {
                module.types.insert(operands[0], Type::Image);
            }
            OP_TYPE_SAMPLER if !operands.is_empty() => {
                module.types.insert(operands[0], Type::Sampler);
            }
            OP_TYPE_SAMPLED_IMAGE if !operands.is_empty() => {
                module.types.insert(operands[0], Type::SampledImage);
            }
            OP_TYPE_ARRAY if operands.len() >= 3 => {
                module.types.insert(
                    operands[0],
                    Type::Array {
                        element: operands[1],
                        length_id: operands[2],
                    },
                );
            }
            OP_TYPE_RUNTIME_ARRAY if !operands.is_empty() => {
                module.types.insert(operands[0], Type::RuntimeArray);
            }
            OP_TYPE_STRUCT if !operands.is_empty() => {
                module.types.insert(operands[0], Type::Struct);
                module
                    .struct_members
                    .insert(operands[0], operands[1..].to_vec());
            }
            OP_TYPE_POINTER if operands.len() >= 3 => {
                module.types.insert(
                    operands[0],
                    Type::Pointer {
                        storage_class: operands[1],
                        pointee: operands[2],
                    },
                );
            }
            OP_CONSTANT if operands.len() >= 3 => {
                module.constants.insert(operands[1], operands[2]);
            }
            OP_VARIABLE if operands.len() >= 3 && !in_function_section => {
                module.variables.push(Variable {
                    id: operands[1],
                    pointer_type: operands[0],
                    storage_class: operands[2],
                });
            }
            OP_FUNCTION => in_function_section = true,
            _ if in_function_section => match opcode {
                OP_LOAD if operands.len() >= 3 => {
                    module.referenced.insert(operands[2]);
                }
                OP_STORE if !operands.is_empty() => {
                    module.referenced.insert(operands[0]);
                }
                OP_COPY_MEMORY if operands.len() >= 2 => {
                    module.referenced.insert(operands[0]);
                    module.referenced.insert(operands[1]);
                }
                OP_ACCESS_CHAIN | OP_IN_BOUNDS_ACCESS_CHAIN | OP_IMAGE_TEXEL_POINTER
                    if operands.len() >= 3 =>
                {
                    module.chain_bases.insert(operands[1], operands[2]);
                }
                OP_FUNCTION_CALL if operands.len() >= 3 => {
                    for &argument in &operands[3..] {
                        module.referenced.insert(argument);
                    }
                }
                OP_ATOMIC_STORE if !operands.is_empty() => {
                    module.referenced.insert(operands[0]);
                }
                OP_ATOMIC_LOAD => {
                    if operands.len() >= 3 {
                        module.referenced.insert(operands[2]);
                    }
                }
                op if (OP_ATOMIC_FIRST_RMW..=OP_ATOMIC_LAST_RMW).contains(&op) => {
                    if operands.len() >= 3 {
                        module.referenced.insert(operands[2]);
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    Ok(module)
}

impl Module {
    fn decoration(&self, id: u32) -> Decorations {
        self.decorations.get(&id).copied().unwrap_or_default()
    }

    /// Variables whose memory is actually touched by the function section,
    /// with access chains resolved back to their base variable.
    fn used_roots(&self) -> HashSet<u32> {
        let mut roots = HashSet::new();
        for &id in &self.referenced {
            let mut current = id;
            // Chains are acyclic in valid modules; the hop bound guards
            // against malformed input.
            for _ in 0..self.chain_bases.len() + 1 {
                match self.chain_bases.get(&current) {
                    Some(&base) => current = base,
                    None => break,
                }
            }
            roots.insert(current);
        }
        roots
    }

    fn is_non_writable(&self, variable: u32, pointee: u32) -> bool {
        if self.decoration(variable).non_writable {
            return true;
        }
        // readonly buffer blocks are usually expressed as NonWritable on
        // every struct member.
        if let Some(members) = self.struct_members.get(&pointee) {
            if !members.is_empty() {
                if let Some(non_writable) = self.member_non_writable.get(&pointee) {
                    return (0..members.len() as u32).all(|i| non_writable.contains(&i));
                }
            }
        }
        false
    }

    fn type_size(&self, id: u32) -> Result<u32> {
        match self.types.get(&id) {
            Some(Type::Bool) => Ok(4),
            Some(Type::Int { width }) | Some(Type::Float { width }) => Ok(width / 8),
            Some(Type::Vector { component, count }) => {
                Ok(self.type_size(*component)? * count)
            }
            Some(Type::Matrix { column, count }) => Ok(self.type_size(*column)? * count),
            Some(Type::Array { element, length_id }) => {
                let length = self.constants.get(length_id).copied().ok_or_else(|| {
                    Error::ShaderReflect("array length is not a scalar constant".into())
                })?;
                let stride = match self.decoration(id).array_stride {
                    Some(stride) => stride,
                    None => self.type_size(*element)?,
                };
                Ok(stride * length)
            }
            Some(Type::Struct) => {
                let members = self
                    .struct_members
                    .get(&id)
                    .cloned()
                    .unwrap_or_default();
                let offsets = self.member_offsets.get(&id);
                let mut size = 0u32;
                for (index, member) in members.iter().enumerate() {
                    let member_size = self.type_size(*member)?;
                    let end = match offsets.and_then(|o| o.get(&(index as u32))) {
                        Some(&offset) => offset + member_size,
                        None => size + member_size,
                    };
                    size = size.max(end);
                }
                Ok(size)
            }
            Some(Type::RuntimeArray) => Err(Error::ShaderReflect(
                "runtime arrays cannot be sized".into(),
            )),
            _ => Err(Error::ShaderReflect(format!("cannot size type %{id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DECORATION_BLOCK: u32 = 2;

    fn inst(opcode: u16, operands: &[u32]) -> Vec<u32> {
        let mut words = vec![((operands.len() as u32 + 1) << 16) | opcode as u32];
        words.extend_from_slice(operands);
        words
    }

    fn assemble(instructions: &[Vec<u32>]) -> Vec<u32> {
        let mut words = vec![SPIRV_MAGIC, 0x0001_0000, 0, 100, 0];
        for instruction in instructions {
            words.extend_from_slice(instruction);
        }
        words
    }

    // Two storage buffers at set 0, the first read-only via member
    // decorations, both referenced through access chains in the body.
    fn two_buffer_module() -> Vec<u32> {
        assemble(&[
            inst(OP_DECORATE, &[10, DECORATION_BLOCK]),
            inst(OP_MEMBER_DECORATE, &[10, 0, DECORATION_OFFSET, 0]),
            inst(OP_MEMBER_DECORATE, &[10, 0, DECORATION_NON_WRITABLE]),
            inst(OP_DECORATE, &[20, DECORATION_DESCRIPTOR_SET, 0]),
            inst(OP_DECORATE, &[20, DECORATION_BINDING, 0]),
            inst(OP_DECORATE, &[11, DECORATION_BLOCK]),
            inst(OP_MEMBER_DECORATE, &[11, 0, DECORATION_OFFSET, 0]),
            inst(OP_DECORATE, &[21, DECORATION_DESCRIPTOR_SET, 0]),
            inst(OP_DECORATE, &[21, DECORATION_BINDING, 1]),
            inst(OP_TYPE_INT, &[2, 32, 0]),
            inst(OP_TYPE_RUNTIME_ARRAY, &[3, 2]),
            inst(OP_TYPE_STRUCT, &[10, 3]),
            inst(OP_TYPE_STRUCT, &[11, 3]),
            inst(OP_TYPE_POINTER, &[12, STORAGE_CLASS_STORAGE_BUFFER, 10]),
            inst(OP_TYPE_POINTER, &[13, STORAGE_CLASS_STORAGE_BUFFER, 11]),
            inst(OP_VARIABLE, &[12, 20, STORAGE_CLASS_STORAGE_BUFFER]),
            inst(OP_VARIABLE, &[13, 21, STORAGE_CLASS_STORAGE_BUFFER]),
            inst(OP_FUNCTION, &[1, 50, 0, 51]),
            inst(OP_ACCESS_CHAIN, &[2, 60, 20, 0]),
            inst(OP_LOAD, &[2, 61, 60]),
            inst(OP_ACCESS_CHAIN, &[2, 62, 21, 0]),
            inst(OP_STORE, &[62, 61]),
        ])
    }

    #[test]
    fn reflects_storage_buffers_with_access() {
        let info = reflect(&two_buffer_module()).unwrap();
        assert_eq!(
            info.set_layouts,
            vec![vec![DescriptorKind::StorageBuffer, DescriptorKind::StorageBuffer]]
        );
        assert_eq!(
            info.access_flags,
            vec![vec![AccessFlags::READ, AccessFlags::READ | AccessFlags::WRITE]]
        );
        assert_eq!(info.push_constant_size, 0);
    }

    #[test]
    fn unreferenced_binding_is_none() {
        let words = assemble(&[
            inst(OP_DECORATE, &[10, DECORATION_BLOCK]),
            inst(OP_DECORATE, &[20, DECORATION_DESCRIPTOR_SET, 0]),
            inst(OP_DECORATE, &[20, DECORATION_BINDING, 0]),
            inst(OP_TYPE_INT, &[2, 32, 0]),
            inst(OP_TYPE_STRUCT, &[10, 2]),
            inst(OP_TYPE_POINTER, &[12, STORAGE_CLASS_STORAGE_BUFFER, 10]),
            inst(OP_VARIABLE, &[12, 20, STORAGE_CLASS_STORAGE_BUFFER]),
            inst(OP_FUNCTION, &[1, 50, 0, 51]),
        ]);
        let info = reflect(&words).unwrap();
        assert_eq!(info.access_flags, vec![vec![AccessFlags::NONE]]);
    }

    #[test]
    fn legacy_buffer_block_reflects_as_storage_buffer() {
        let words = assemble(&[
            inst(OP_DECORATE, &[10, DECORATION_BUFFER_BLOCK]),
            inst(OP_DECORATE, &[20, DECORATION_DESCRIPTOR_SET, 1]),
            inst(OP_DECORATE, &[20, DECORATION_BINDING, 0]),
            inst(OP_TYPE_INT, &[2, 32, 0]),
            inst(OP_TYPE_STRUCT, &[10, 2]),
            inst(OP_TYPE_POINTER, &[12, STORAGE_CLASS_UNIFORM, 10]),
            inst(OP_VARIABLE, &[12, 20, STORAGE_CLASS_UNIFORM]),
            inst(OP_FUNCTION, &[1, 50, 0, 51]),
            inst(OP_ACCESS_CHAIN, &[2, 60, 20, 0]),
            inst(OP_LOAD, &[2, 61, 60]),
        ]);
        let info = reflect(&words).unwrap();
        assert_eq!(info.set_layouts.len(), 2);
        assert!(info.set_layouts[0].is_empty());
        assert_eq!(info.set_layouts[1], vec![DescriptorKind::StorageBuffer]);
        // No NonWritable decoration, so the binding reflects as read-write
        // even though the body only loads.
        assert_eq!(
            info.access_flags[1],
            vec![AccessFlags::READ | AccessFlags::WRITE]
        );
    }

    #[test]
    fn reflects_storage_image() {
        let words = assemble(&[
            inst(OP_DECORATE, &[30, DECORATION_DESCRIPTOR_SET, 0]),
            inst(OP_DECORATE, &[30, DECORATION_BINDING, 0]),
            inst(OP_TYPE_FLOAT, &[2, 32]),
            inst(OP_TYPE_IMAGE, &[4, 2, 1, 0, 0, 0, 2, 4]),
            inst(OP_TYPE_POINTER, &[5, STORAGE_CLASS_UNIFORM_CONSTANT, 4]),
            inst(OP_VARIABLE, &[5, 30, STORAGE_CLASS_UNIFORM_CONSTANT]),
            inst(OP_FUNCTION, &[1, 50, 0, 51]),
            inst(OP_LOAD, &[4, 60, 30]),
        ]);
        let info = reflect(&words).unwrap();
        assert_eq!(info.set_layouts, vec![vec![DescriptorKind::StorageImage]]);
        assert_eq!(
            info.access_flags,
            vec![vec![AccessFlags::READ | AccessFlags::WRITE]]
        );
    }

    #[test]
    fn push_constant_block_size_from_offsets() {
        // struct { uint a; /* pad */ vec4 b; } with b at offset 16 => 32 bytes.
        let words = assemble(&[
            inst(OP_MEMBER_DECORATE, &[10, 0, DECORATION_OFFSET, 0]),
            inst(OP_MEMBER_DECORATE, &[10, 1, DECORATION_OFFSET, 16]),
            inst(OP_TYPE_INT, &[2, 32, 0]),
            inst(OP_TYPE_FLOAT, &[3, 32]),
            inst(OP_TYPE_VECTOR, &[4, 3, 4]),
            inst(OP_TYPE_STRUCT, &[10, 2, 4]),
            inst(OP_TYPE_POINTER, &[12, STORAGE_CLASS_PUSH_CONSTANT, 10]),
            inst(OP_VARIABLE, &[12, 20, STORAGE_CLASS_PUSH_CONSTANT]),
        ]);
        let info = reflect(&words).unwrap();
        assert_eq!(info.push_constant_size, 32);
        assert!(info.set_layouts.is_empty());
    }

    #[test]
    fn sampled_image_is_unsupported() {
        let words = assemble(&[
            inst(OP_DECORATE, &[30, DECORATION_DESCRIPTOR_SET, 0]),
            inst(OP_DECORATE, &[30, DECORATION_BINDING, 0]),
            inst(OP_TYPE_FLOAT, &[2, 32]),
            inst(OP_TYPE_IMAGE, &[4, 2, 1, 0, 0, 0, 1, 0]),
            inst(OP_TYPE_SAMPLED_IMAGE, &[6, 4]),
            inst(OP_TYPE_POINTER, &[5, STORAGE_CLASS_UNIFORM_CONSTANT, 6]),
            inst(OP_VARIABLE, &[5, 30, STORAGE_CLASS_UNIFORM_CONSTANT]),
        ]);
        assert!(matches!(reflect(&words), Err(Error::ShaderReflect(_))));
    }

    #[test]
    fn rejects_bad_magic() {
        let words = vec![0xdead_beef, 0x0001_0000, 0, 8, 0];
        assert!(matches!(reflect(&words), Err(Error::ShaderReflect(_))));
    }

    #[test]
    fn rejects_unaligned_bytes() {
        assert!(matches!(
            words_from_bytes(&[1, 2, 3]),
            Err(Error::ShaderReflect(_))
        ));
    }
}
