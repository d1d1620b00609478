//! Just enough SPIR-V parsing to build a compute pipeline layout without
//! the caller describing it: the entry point, its local size and the buffer
//! bindings of descriptor set 0.

use std::collections::HashMap;

use crate::gpu::{BufferBinding, ComputeError, Result};

const MAGIC: u32 = 0x0723_0203;
const HEADER_WORDS: usize = 5;
/// From 1.4 on, an entry point's interface lists every global it uses.
const VERSION_1_4: u32 = 0x0001_0400;

const OP_ENTRY_POINT: u32 = 15;
const OP_EXECUTION_MODE: u32 = 16;
const OP_TYPE_POINTER: u32 = 32;
const OP_VARIABLE: u32 = 59;
const OP_DECORATE: u32 = 71;

const EXEC_MODEL_GL_COMPUTE: u32 = 5;
const EXEC_MODE_LOCAL_SIZE: u32 = 17;

const DECORATION_BLOCK: u32 = 2;
const DECORATION_BUFFER_BLOCK: u32 = 3;
const DECORATION_BINDING: u32 = 33;
const DECORATION_DESCRIPTOR_SET: u32 = 34;

const STORAGE_UNIFORM_CONSTANT: u32 = 0;
const STORAGE_UNIFORM: u32 = 2;
const STORAGE_PUSH_CONSTANT: u32 = 9;
const STORAGE_STORAGE_BUFFER: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// `uniform` block; takes constant buffers.
    Uniform,
    /// `buffer` block; takes structured buffers.
    Storage,
}

impl DescriptorKind {
    pub fn accepts(self, binding: BufferBinding) -> bool {
        match self {
            DescriptorKind::Uniform => binding == BufferBinding::Constant,
            DescriptorKind::Storage => binding != BufferBinding::Constant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectedBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelReflection {
    /// Declared `LocalSize`, if the module uses the literal form.
    pub local_size: Option<[u32; 3]>,
    /// Sorted by binding index.
    pub bindings: Vec<ReflectedBinding>,
}

impl KernelReflection {
    pub fn binding(&self, slot: u32) -> Option<&ReflectedBinding> {
        self.bindings.iter().find(|b| b.binding == slot)
    }
}

struct Instruction<'a> {
    opcode: u32,
    operands: &'a [u32],
}

fn instructions(words: &[u32]) -> impl Iterator<Item = Result<Instruction<'_>>> {
    let mut pos = HEADER_WORDS;
    std::iter::from_fn(move || {
        if pos >= words.len() {
            return None;
        }
        let count = (words[pos] >> 16) as usize;
        let opcode = words[pos] & 0xffff;
        if count == 0 || pos + count > words.len() {
            pos = words.len();
            return Some(Err(ComputeError::compile(format!(
                "truncated instruction (opcode {}) in SPIR-V module",
                opcode
            ))));
        }
        let operands = &words[pos + 1..pos + count];
        pos += count;
        Some(Ok(Instruction { opcode, operands }))
    })
}

/// Decode a nul-terminated literal string packed little-endian into words.
fn literal_string(words: &[u32]) -> String {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    'outer: for word in words {
        for b in word.to_le_bytes() {
            if b == 0 {
                break 'outer;
            }
            bytes.push(b);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Number of words a literal string occupies, terminator included.
fn literal_words(words: &[u32]) -> usize {
    words
        .iter()
        .position(|w| w.to_le_bytes().contains(&0))
        .map_or(words.len(), |i| i + 1)
}

/// Locate the GLCompute entry point `entry` and collect the resource
/// bindings the pipeline layout needs.
///
/// Modules of version 1.4 or later only contribute the variables in the
/// entry point's interface; older ones contribute every set-0 buffer.
pub fn reflect(words: &[u32], entry: &str) -> Result<KernelReflection> {
    if words.len() < HEADER_WORDS || words[0] != MAGIC {
        return Err(ComputeError::compile("not a SPIR-V module"));
    }
    let lists_globals = words[1] >= VERSION_1_4;

    let mut entry_id = None;
    let mut interface: Option<Vec<u32>> = None;
    let mut local_sizes: HashMap<u32, [u32; 3]> = HashMap::new();
    let mut bindings: HashMap<u32, u32> = HashMap::new();
    let mut sets: HashMap<u32, u32> = HashMap::new();
    let mut buffer_blocks: Vec<u32> = Vec::new();
    let mut pointers: HashMap<u32, u32> = HashMap::new();
    let mut variables: Vec<(u32, u32, u32)> = Vec::new();

    for inst in instructions(words) {
        let inst = inst?;
        let ops = inst.operands;
        match inst.opcode {
            OP_ENTRY_POINT if ops.len() >= 3 => {
                if ops[0] == EXEC_MODEL_GL_COMPUTE && literal_string(&ops[2..]) == entry {
                    entry_id = Some(ops[1]);
                    if lists_globals {
                        let ids = 2 + literal_words(&ops[2..]);
                        interface = Some(ops.get(ids..).unwrap_or_default().to_vec());
                    }
                }
            }
            OP_EXECUTION_MODE if ops.len() >= 5 && ops[1] == EXEC_MODE_LOCAL_SIZE => {
                local_sizes.insert(ops[0], [ops[2], ops[3], ops[4]]);
            }
            OP_DECORATE if ops.len() >= 2 => match ops[1] {
                DECORATION_BINDING if ops.len() >= 3 => {
                    bindings.insert(ops[0], ops[2]);
                }
                DECORATION_DESCRIPTOR_SET if ops.len() >= 3 => {
                    sets.insert(ops[0], ops[2]);
                }
                DECORATION_BUFFER_BLOCK => buffer_blocks.push(ops[0]),
                DECORATION_BLOCK => {}
                _ => {}
            },
            OP_TYPE_POINTER if ops.len() >= 3 => {
                pointers.insert(ops[0], ops[2]);
            }
            OP_VARIABLE if ops.len() >= 3 => {
                variables.push((ops[1], ops[0], ops[2]));
            }
            _ => {}
        }
    }

    let entry_id = entry_id.ok_or_else(|| ComputeError::EntryPointNotFound(entry.to_string()))?;

    let mut out = Vec::new();
    for (id, ty, storage) in variables {
        if let Some(interface) = &interface {
            if !interface.contains(&id) {
                continue;
            }
        }

        let kind = match storage {
            STORAGE_STORAGE_BUFFER => DescriptorKind::Storage,
            STORAGE_UNIFORM => {
                let pointee = pointers.get(&ty).copied().unwrap_or_default();
                if buffer_blocks.contains(&pointee) {
                    DescriptorKind::Storage
                } else {
                    DescriptorKind::Uniform
                }
            }
            STORAGE_UNIFORM_CONSTANT if bindings.contains_key(&id) => {
                return Err(ComputeError::compile(
                    "images and samplers are not supported; only buffer arguments are",
                ))
            }
            STORAGE_PUSH_CONSTANT => {
                return Err(ComputeError::compile("push constants are not supported"))
            }
            _ => continue,
        };

        let binding = bindings.get(&id).copied().ok_or_else(|| {
            ComputeError::compile(format!("buffer variable %{} has no Binding decoration", id))
        })?;
        let set = sets.get(&id).copied().unwrap_or(0);
        if set != 0 {
            return Err(ComputeError::compile(format!(
                "binding {} uses descriptor set {}; only set 0 is supported",
                binding, set
            )));
        }
        if out.iter().any(|b: &ReflectedBinding| b.binding == binding) {
            return Err(ComputeError::compile(format!(
                "binding {} is declared more than once",
                binding
            )));
        }

        out.push(ReflectedBinding { binding, kind });
    }
    out.sort_by_key(|b| b.binding);

    Ok(KernelReflection {
        local_size: local_sizes.get(&entry_id).copied(),
        bindings: out,
    })
}
