//! Just enough SPIR-V parsing to validate a program blob before handing it to
//! the driver: magic number, entry points and debug names.

use hashbrown::HashSet;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

const HEADER_WORDS: usize = 5;
const OP_NAME: u32 = 5;
const OP_ENTRY_POINT: u32 = 15;

/// Ray tracing execution models, as encoded in `OpEntryPoint`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionModel {
    RayGeneration,
    Intersection,
    AnyHit,
    ClosestHit,
    Miss,
    Callable,
    Other(u32),
}

impl ExecutionModel {
    fn from_word(word: u32) -> Self {
        match word {
            5313 => Self::RayGeneration,
            5314 => Self::Intersection,
            5315 => Self::AnyHit,
            5316 => Self::ClosestHit,
            5317 => Self::Miss,
            5318 => Self::Callable,
            other => Self::Other(other),
        }
    }
}

/// An entry point declared by the module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryPoint {
    pub model: ExecutionModel,
    pub name: String,
}

/// A parsed SPIR-V module.
#[derive(Clone, Debug)]
pub struct SpirvModule {
    /// Module words in host byte order.
    pub words: Vec<u32>,
    pub entry_points: Vec<EntryPoint>,
    /// Names attached with `OpName`.
    pub debug_names: HashSet<String>,
}

impl SpirvModule {
    /// Parse a blob, rejecting anything that is not well-formed SPIR-V.
    pub fn parse(blob: &[u8]) -> Result<Self, String> {
        if blob.len() % 4 != 0 {
            return Err(format!("blob length {} is not a multiple of 4", blob.len()));
        }
        if blob.len() < HEADER_WORDS * 4 {
            return Err("blob is shorter than a SPIR-V header".to_string());
        }

        let mut words: Vec<u32> = blob
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        if words[0] == SPIRV_MAGIC.swap_bytes() {
            for word in &mut words {
                *word = word.swap_bytes();
            }
        } else if words[0] != SPIRV_MAGIC {
            return Err(format!("bad SPIR-V magic {:#010x}", words[0]));
        }

        let mut entry_points = Vec::new();
        let mut debug_names = HashSet::new();

        let mut at = HEADER_WORDS;
        while at < words.len() {
            let word_count = (words[at] >> 16) as usize;
            let opcode = words[at] & 0xffff;
            if word_count == 0 || at + word_count > words.len() {
                return Err(format!("malformed instruction at word {at}"));
            }
            let operands = &words[at + 1..at + word_count];

            match opcode {
                OP_ENTRY_POINT if operands.len() >= 3 => {
                    entry_points.push(EntryPoint {
                        model: ExecutionModel::from_word(operands[0]),
                        name: decode_string(&operands[2..]),
                    });
                }
                OP_NAME if operands.len() >= 2 => {
                    debug_names.insert(decode_string(&operands[1..]));
                }
                _ => {}
            }

            at += word_count;
        }

        Ok(Self {
            words,
            entry_points,
            debug_names,
        })
    }

    /// Execution model of the named entry point.
    #[must_use]
    pub fn entry_point(&self, name: &str) -> Option<ExecutionModel> {
        self.entry_points
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.model)
    }
}

/// Decode a nul-terminated literal string packed little-endian into words.
fn decode_string(words: &[u32]) -> String {
    let bytes: Vec<u8> = words
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .take_while(|&b| b != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
