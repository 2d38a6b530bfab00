#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use mainframe_core::{
    psw, Architecture, CpuConfig, FlatStorage, Instruction, InterruptKind, Processor,
    SystemContext, MAX_INSTRUCTION_LEN,
};

fuzz_target!(|data: &[u8]| {
    if data.len() < 16 + MAX_INSTRUCTION_LEN {
        return;
    }
    let (image, code) = data.split_at(16);

    for arch in Architecture::ALL {
        let len = arch.psw_len();
        if let Ok(decoded) = psw::decode(arch, arch.default_facilities(), &image[..len]) {
            let encoded = psw::encode(arch, &decoded);
            assert_eq!(psw::decode(arch, arch.default_facilities(), encoded.as_bytes()), Ok(decoded));
        }
    }
    let _ = psw::decode_short(Architecture::ZArch.default_facilities(), &image[..8]);
    let _ = Instruction::decode(0x1000, &code[..MAX_INSTRUCTION_LEN]);

    let arch = Architecture::ALL[usize::from(code[0] % 3)];
    let ctx = Arc::new(SystemContext::new(CpuConfig {
        arch,
        facilities: arch.default_facilities(),
        ..CpuConfig::default()
    }));
    let storage = Arc::new(FlatStorage::new(0x1_0000));
    let _ = storage.load(arch.psa().new_psw(InterruptKind::Program), &image[..arch.psw_len()]);
    let _ = storage.load(0x1000, code);
    let _ = ctx.start(0);
    let mut cpu = Processor::new(0, ctx, storage);
    let _ = cpu.state_mut().load_psw(&image[..arch.psw_len()]);
    for _ in 0..4 {
        let _ = cpu.step();
    }
});
