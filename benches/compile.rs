//! Compilation throughput over synthetic straight-line blocks.

use rvjit::{compile_block, BasicBlock, CompileOptions, DecodedInst, GuestOpcode};

fn main() {
    divan::main();
}

/// A block of dependent ALU and memory instructions cycling through the
/// argument registers, the shape of hot integer code.
fn synthetic_block(len: usize) -> BasicBlock {
    let insts: Vec<DecodedInst> = (0..len)
        .map(|i| {
            let rd = 10 + (i % 8) as u8;
            let rs1 = 10 + ((i + 1) % 8) as u8;
            match i % 4 {
                0 => DecodedInst::new(GuestOpcode::Addi, rd, rs1, 0, i as i64),
                1 => DecodedInst::new(GuestOpcode::Add, rd, rs1, 10 + ((i + 2) % 8) as u8, 0),
                2 => DecodedInst::new(GuestOpcode::Lw, rd, rs1, 0, 8),
                _ => DecodedInst::new(GuestOpcode::Slli, rd, rs1, 0, (i % 63) as i64),
            }
        })
        .collect();
    let end_pc = 0x1_0000 + 4 * len as u64;
    BasicBlock {
        start_pc: 0x1_0000,
        end_pc,
        insts,
    }
}

#[divan::bench(args = [4, 16, 64, 256])]
fn compile(bencher: divan::Bencher, len: usize) {
    let block = synthetic_block(len);
    let options = CompileOptions::default();
    bencher.bench(|| compile_block(divan::black_box(&block), &options));
}
