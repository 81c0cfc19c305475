//! Typed control-channel messages and their wire form.
//!
//! Every message is `id:i32 | argc:i32 | (len:i32, bytes)^argc`, with
//! each argument a length-prefixed byte string. Numbers ride as decimal
//! text (always '.'-separated, never locale-dependent) so host and
//! worker never disagree on integer width or endianness.

use smallvec::SmallVec;

/// The closed identifier set. `UserBase` and everything above it is
/// reserved for format-specific extensions, which is why [`Message`]
/// keeps the raw `i32` rather than this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageId {
    Undefined = 0,
    HostInfoGotten = 1,
    InitDone = 2,
    Quit = 3,
    SampleRateInformation = 4,
    BufferSizeInformation = 5,
    InformationUpdated = 6,
    MidiEvent = 7,
    StartProcessing = 8,
    ProcessingDone = 9,
    ChangeSharedMemoryKey = 10,
    ChangeInputCount = 11,
    ChangeOutputCount = 12,
    ChangeInputOutputCount = 13,
    ShowUi = 14,
    HideUi = 15,
    ToggleUi = 16,
    IsUiVisible = 17,
    SaveSettingsToString = 18,
    SaveSettingsToFile = 19,
    LoadSettingsFromString = 20,
    LoadSettingsFromFile = 21,
    SavePresetFile = 22,
    LoadPresetFile = 23,
    DebugMessage = 24,
    UserBase = 64,
}

impl MessageId {
    pub const fn raw(self) -> i32 {
        self as i32
    }

    pub fn from_raw(id: i32) -> Option<Self> {
        use MessageId::*;
        Some(match id {
            0 => Undefined,
            1 => HostInfoGotten,
            2 => InitDone,
            3 => Quit,
            4 => SampleRateInformation,
            5 => BufferSizeInformation,
            6 => InformationUpdated,
            7 => MidiEvent,
            8 => StartProcessing,
            9 => ProcessingDone,
            10 => ChangeSharedMemoryKey,
            11 => ChangeInputCount,
            12 => ChangeOutputCount,
            13 => ChangeInputOutputCount,
            14 => ShowUi,
            15 => HideUi,
            16 => ToggleUi,
            17 => IsUiVisible,
            18 => SaveSettingsToString,
            19 => SaveSettingsToFile,
            20 => LoadSettingsFromString,
            21 => LoadSettingsFromFile,
            22 => SavePresetFile,
            23 => LoadPresetFile,
            24 => DebugMessage,
            64 => UserBase,
            _ => return None,
        })
    }
}

impl From<MessageId> for i32 {
    fn from(id: MessageId) -> i32 {
        id.raw()
    }
}

type Args = SmallVec<[Vec<u8>; 4]>;

/// One control-channel message: an identifier plus an ordered list of
/// byte-string arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i32,
    args: Args,
}

impl Message {
    pub fn new(id: MessageId) -> Self {
        Self::from_raw_id(id.raw())
    }

    /// For extension identifiers at `UserBase` and above.
    pub fn from_raw_id(id: i32) -> Self {
        Self {
            id,
            args: SmallVec::new(),
        }
    }

    /// The sentinel yielded by a dead endpoint.
    pub fn undefined() -> Self {
        Self::new(MessageId::Undefined)
    }

    pub fn is(&self, id: MessageId) -> bool {
        self.id == id.raw()
    }

    pub fn with_str(mut self, s: &str) -> Self {
        self.args.push(s.as_bytes().to_vec());
        self
    }

    pub fn with_int(mut self, i: i32) -> Self {
        self.args.push(i.to_string().into_bytes());
        self
    }

    pub fn with_float(mut self, f: f32) -> Self {
        // Fixed six decimals, like C's "%f" under the C locale.
        self.args.push(format!("{:.6}", f).into_bytes());
        self
    }

    pub(crate) fn push_arg(&mut self, bytes: Vec<u8>) {
        self.args.push(bytes);
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, index: usize) -> &[u8] {
        self.args.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn args(&self) -> impl Iterator<Item = &[u8]> {
        self.args.iter().map(Vec::as_slice)
    }

    pub fn str_arg(&self, index: usize) -> String {
        String::from_utf8_lossy(self.arg(index)).into_owned()
    }

    /// Missing or malformed arguments parse as zero.
    pub fn int_arg(&self, index: usize) -> i32 {
        self.str_arg(index).trim().parse().unwrap_or(0)
    }

    pub fn float_arg(&self, index: usize) -> f32 {
        self.str_arg(index).trim().parse().unwrap_or(0.0)
    }

    /// Total encoded size on the wire: id + argc + one length prefix
    /// per argument plus its bytes.
    pub fn encoded_len(&self) -> usize {
        8 + self.args.iter().map(|a| 4 + a.len()).sum::<usize>()
    }
}
