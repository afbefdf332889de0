use bitflags::bitflags;

bitflags! {
    /// Which optional [`Header`] fields are meaningful for a dialect.
    ///
    /// A cleared bit means the dialect neither stores nor reconstructs the
    /// field; a set bit means the field carries real data for the detected
    /// or selected format.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct HeaderFields: u32 {
        const KERNEL_ADDRESS = 1 << 0;
        const RAMDISK_ADDRESS = 1 << 1;
        const SECONDBOOT_ADDRESS = 1 << 2;
        const KERNEL_TAGS_ADDRESS = 1 << 3;
        const PAGE_SIZE = 1 << 4;
        const BOARD_NAME = 1 << 5;
        const KERNEL_CMDLINE = 1 << 6;
        const ID = 1 << 7;
    }
}

/// The dialect-independent boot image header.
///
/// Every field is optional because `0` is a legal load address; absence and
/// zero are different things. [`Header::supported_fields`] tells the caller
/// which fields the producing or consuming dialect actually honors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    /// Address the kernel should be loaded to.
    pub kernel_address: Option<u32>,
    /// Address the ramdisk should be loaded to.
    pub ramdisk_address: Option<u32>,
    /// Address the optional second bootloader should be loaded to.
    pub secondboot_address: Option<u32>,
    /// Physical address of the kernel tags.
    pub kernel_tags_address: Option<u32>,
    /// Alignment granularity of all segments. Must be set before any
    /// segment operation on the write side.
    pub page_size: Option<u32>,
    /// Name of the board, at most 15 bytes of ASCII.
    pub board_name: Option<String>,
    /// Arguments to pass to the kernel during boot, at most 511 bytes.
    pub kernel_cmdline: Option<String>,
    /// SHA-1 identity fingerprint over the payload. Computed by the writer;
    /// callers never need to set it.
    pub id: Option<[u8; 20]>,
    /// Which of the fields above are meaningful for the dialect that filled
    /// in (or will consume) this header.
    pub supported_fields: HeaderFields,
}
