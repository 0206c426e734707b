use core::mem::offset_of;

/// Register state saved across a context switch.
///
/// The layout is read by the switch routine in `arch::x86`, so field order and
/// offsets are fixed.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Context {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cr3: u32,
}

const _: () = {
    assert!(offset_of!(Context, ebx) == 4);
    assert!(offset_of!(Context, esi) == 16);
    assert!(offset_of!(Context, edi) == 20);
    assert!(offset_of!(Context, ebp) == 24);
    assert!(offset_of!(Context, esp) == 28);
    assert!(offset_of!(Context, eip) == 32);
    assert!(offset_of!(Context, eflags) == 36);
    assert!(offset_of!(Context, cr3) == 40);
};

impl Context {
    /// A context that starts executing at `eip` on a fresh stack.
    pub fn for_entry(eip: u32, esp: u32, eflags: u32, cr3: u32) -> Self {
        Context {
            esp,
            ebp: esp,
            eip,
            eflags,
            cr3,
            ..Context::default()
        }
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let mut ds = f.debug_struct("Context");

        ds.field("eax", &format_args!("{:#010x}", self.eax))
            .field("ebx", &format_args!("{:#010x}", self.ebx))
            .field("ecx", &format_args!("{:#010x}", self.ecx))
            .field("edx", &format_args!("{:#010x}", self.edx))
            .field("esi", &format_args!("{:#010x}", self.esi))
            .field("edi", &format_args!("{:#010x}", self.edi))
            .field("ebp", &format_args!("{:#010x}", self.ebp))
            .field("esp", &format_args!("{:#010x}", self.esp))
            .field("eip", &format_args!("{:#010x}", self.eip))
            .field("eflags", &format_args!("{:#010x}", self.eflags))
            .field("cr3", &format_args!("{:#010x}", self.cr3));

        ds.finish()
    }
}
