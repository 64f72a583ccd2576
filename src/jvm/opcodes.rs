//! Opcode numbers and the static per-opcode tables derived from them
//!
//! Everything here is computed at compile time: the shape of each instruction (which decides how
//! many operand bytes follow the opcode), the fixed operand stack delta of each instruction, and
//! the mnemonic used in textual listings.
//!
//! [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-6.html

pub const NOP: u8 = 0;
pub const ACONST_NULL: u8 = 1;
pub const ICONST_M1: u8 = 2;
pub const ICONST_0: u8 = 3;
pub const ICONST_1: u8 = 4;
pub const ICONST_2: u8 = 5;
pub const ICONST_3: u8 = 6;
pub const ICONST_4: u8 = 7;
pub const ICONST_5: u8 = 8;
pub const LCONST_0: u8 = 9;
pub const LCONST_1: u8 = 10;
pub const FCONST_0: u8 = 11;
pub const FCONST_1: u8 = 12;
pub const FCONST_2: u8 = 13;
pub const DCONST_0: u8 = 14;
pub const DCONST_1: u8 = 15;
pub const BIPUSH: u8 = 16;
pub const SIPUSH: u8 = 17;
pub const LDC: u8 = 18;
pub const LDC_W: u8 = 19;
pub const LDC2_W: u8 = 20;
pub const ILOAD: u8 = 21;
pub const LLOAD: u8 = 22;
pub const FLOAD: u8 = 23;
pub const DLOAD: u8 = 24;
pub const ALOAD: u8 = 25;
pub const ILOAD_0: u8 = 26;
pub const ALOAD_3: u8 = 45;
pub const IALOAD: u8 = 46;
pub const LALOAD: u8 = 47;
pub const FALOAD: u8 = 48;
pub const DALOAD: u8 = 49;
pub const AALOAD: u8 = 50;
pub const BALOAD: u8 = 51;
pub const CALOAD: u8 = 52;
pub const SALOAD: u8 = 53;
pub const ISTORE: u8 = 54;
pub const LSTORE: u8 = 55;
pub const FSTORE: u8 = 56;
pub const DSTORE: u8 = 57;
pub const ASTORE: u8 = 58;
pub const ISTORE_0: u8 = 59;
pub const ASTORE_3: u8 = 78;
pub const IASTORE: u8 = 79;
pub const LASTORE: u8 = 80;
pub const FASTORE: u8 = 81;
pub const DASTORE: u8 = 82;
pub const AASTORE: u8 = 83;
pub const BASTORE: u8 = 84;
pub const CASTORE: u8 = 85;
pub const SASTORE: u8 = 86;
pub const POP: u8 = 87;
pub const POP2: u8 = 88;
pub const DUP: u8 = 89;
pub const DUP_X1: u8 = 90;
pub const DUP_X2: u8 = 91;
pub const DUP2: u8 = 92;
pub const DUP2_X1: u8 = 93;
pub const DUP2_X2: u8 = 94;
pub const SWAP: u8 = 95;
pub const IADD: u8 = 96;
pub const LADD: u8 = 97;
pub const FADD: u8 = 98;
pub const DADD: u8 = 99;
pub const ISUB: u8 = 100;
pub const LSUB: u8 = 101;
pub const FSUB: u8 = 102;
pub const DSUB: u8 = 103;
pub const IMUL: u8 = 104;
pub const LMUL: u8 = 105;
pub const FMUL: u8 = 106;
pub const DMUL: u8 = 107;
pub const IDIV: u8 = 108;
pub const LDIV: u8 = 109;
pub const FDIV: u8 = 110;
pub const DDIV: u8 = 111;
pub const IREM: u8 = 112;
pub const LREM: u8 = 113;
pub const FREM: u8 = 114;
pub const DREM: u8 = 115;
pub const INEG: u8 = 116;
pub const LNEG: u8 = 117;
pub const FNEG: u8 = 118;
pub const DNEG: u8 = 119;
pub const ISHL: u8 = 120;
pub const LSHL: u8 = 121;
pub const ISHR: u8 = 122;
pub const LSHR: u8 = 123;
pub const IUSHR: u8 = 124;
pub const LUSHR: u8 = 125;
pub const IAND: u8 = 126;
pub const LAND: u8 = 127;
pub const IOR: u8 = 128;
pub const LOR: u8 = 129;
pub const IXOR: u8 = 130;
pub const LXOR: u8 = 131;
pub const IINC: u8 = 132;
pub const I2L: u8 = 133;
pub const I2F: u8 = 134;
pub const I2D: u8 = 135;
pub const L2I: u8 = 136;
pub const L2F: u8 = 137;
pub const L2D: u8 = 138;
pub const F2I: u8 = 139;
pub const F2L: u8 = 140;
pub const F2D: u8 = 141;
pub const D2I: u8 = 142;
pub const D2L: u8 = 143;
pub const D2F: u8 = 144;
pub const I2B: u8 = 145;
pub const I2C: u8 = 146;
pub const I2S: u8 = 147;
pub const LCMP: u8 = 148;
pub const FCMPL: u8 = 149;
pub const FCMPG: u8 = 150;
pub const DCMPL: u8 = 151;
pub const DCMPG: u8 = 152;
pub const IFEQ: u8 = 153;
pub const IFNE: u8 = 154;
pub const IFLT: u8 = 155;
pub const IFGE: u8 = 156;
pub const IFGT: u8 = 157;
pub const IFLE: u8 = 158;
pub const IF_ICMPEQ: u8 = 159;
pub const IF_ICMPNE: u8 = 160;
pub const IF_ICMPLT: u8 = 161;
pub const IF_ICMPGE: u8 = 162;
pub const IF_ICMPGT: u8 = 163;
pub const IF_ICMPLE: u8 = 164;
pub const IF_ACMPEQ: u8 = 165;
pub const IF_ACMPNE: u8 = 166;
pub const GOTO: u8 = 167;
pub const JSR: u8 = 168;
pub const RET: u8 = 169;
pub const TABLESWITCH: u8 = 170;
pub const LOOKUPSWITCH: u8 = 171;
pub const IRETURN: u8 = 172;
pub const LRETURN: u8 = 173;
pub const FRETURN: u8 = 174;
pub const DRETURN: u8 = 175;
pub const ARETURN: u8 = 176;
pub const RETURN: u8 = 177;
pub const GETSTATIC: u8 = 178;
pub const PUTSTATIC: u8 = 179;
pub const GETFIELD: u8 = 180;
pub const PUTFIELD: u8 = 181;
pub const INVOKEVIRTUAL: u8 = 182;
pub const INVOKESPECIAL: u8 = 183;
pub const INVOKESTATIC: u8 = 184;
pub const INVOKEINTERFACE: u8 = 185;
pub const INVOKEDYNAMIC: u8 = 186;
pub const NEW: u8 = 187;
pub const NEWARRAY: u8 = 188;
pub const ANEWARRAY: u8 = 189;
pub const ARRAYLENGTH: u8 = 190;
pub const ATHROW: u8 = 191;
pub const CHECKCAST: u8 = 192;
pub const INSTANCEOF: u8 = 193;
pub const MONITORENTER: u8 = 194;
pub const MONITOREXIT: u8 = 195;
pub const WIDE: u8 = 196;
pub const MULTIANEWARRAY: u8 = 197;
pub const IFNULL: u8 = 198;
pub const IFNONNULL: u8 = 199;
pub const GOTO_W: u8 = 200;
pub const JSR_W: u8 = 201;

/// First of the internal opcodes marking a 16-bit jump whose offset did not fit
///
/// While a forward jump is being resolved, its real offset might turn out to be outside of the
/// signed 16-bit range. The jump opcode is then temporarily replaced by one of these markers
/// (`if*`/`goto`/`jsr` map to `202..=217`, `ifnull`/`ifnonnull` map to `218..=219`) and the
/// offset is written as an _unsigned_ 16-bit value. These never survive into a finished method.
pub const OVERSIZED_JUMP_FIRST: u8 = 202;
pub const OVERSIZED_JUMP_LAST: u8 = 219;

/// Operand layout of an instruction
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InsnShape {
    /// Opcode only
    NoArg,

    /// Opcode with the local variable index baked in (eg. `iload_2`)
    ImplicitVar,

    /// Opcode followed by an unsigned byte local variable index
    Var,

    /// Opcode followed by a signed byte (`bipush`) or array type code (`newarray`)
    Byte,

    /// `sipush`
    Short,

    /// `ldc`
    Ldc,

    /// `ldc_w` and `ldc2_w`
    LdcWide,

    /// Field accesses and non-interface invokes (`u16` constant index)
    FieldOrMethod,

    /// `invokeinterface` (`u16` index, count byte, zero byte)
    InterfaceMethod,

    /// `invokedynamic` (`u16` index, two zero bytes)
    InvokeDynamic,

    /// `new`, `anewarray`, `checkcast`, `instanceof`
    Type,

    /// `iinc` (index byte, signed increment byte)
    Iinc,

    /// Conditional jumps, `goto`, `jsr` (signed 16-bit offset)
    Jump,

    /// Marked oversized jump (unsigned 16-bit offset)
    OversizedJump,

    /// `goto_w` and `jsr_w` (signed 32-bit offset)
    WideJump,

    TableSwitch,
    LookupSwitch,

    /// `wide` prefix
    Wide,

    MultiANewArray,

    /// Not a valid opcode
    Invalid,
}

const fn shape_of(opcode: u8) -> InsnShape {
    match opcode {
        0..=15 | 46..=53 | 79..=131 | 133..=152 | 172..=177 | 190 | 191 | 194 | 195 => {
            InsnShape::NoArg
        }
        26..=45 | 59..=78 => InsnShape::ImplicitVar,
        21..=25 | 54..=58 | 169 => InsnShape::Var,
        16 | 188 => InsnShape::Byte,
        17 => InsnShape::Short,
        18 => InsnShape::Ldc,
        19 | 20 => InsnShape::LdcWide,
        178..=184 => InsnShape::FieldOrMethod,
        185 => InsnShape::InterfaceMethod,
        186 => InsnShape::InvokeDynamic,
        187 | 189 | 192 | 193 => InsnShape::Type,
        132 => InsnShape::Iinc,
        153..=168 | 198 | 199 => InsnShape::Jump,
        OVERSIZED_JUMP_FIRST..=OVERSIZED_JUMP_LAST => InsnShape::OversizedJump,
        200 | 201 => InsnShape::WideJump,
        170 => InsnShape::TableSwitch,
        171 => InsnShape::LookupSwitch,
        196 => InsnShape::Wide,
        197 => InsnShape::MultiANewArray,
        _ => InsnShape::Invalid,
    }
}

/// Instruction shape, indexed by opcode
pub const SHAPES: [InsnShape; 256] = {
    let mut table = [InsnShape::Invalid; 256];
    let mut opcode = 0;
    while opcode < 256 {
        table[opcode] = shape_of(opcode as u8);
        opcode += 1;
    }
    table
};

/// Sentinel for instructions whose stack effect depends on their operand
pub const VARIABLE_DELTA: i8 = i8::MIN;

const fn stack_delta_of(opcode: u8) -> i8 {
    match opcode {
        NOP | SWAP | INEG | LNEG | FNEG | DNEG | IINC | I2F | L2D | F2I | D2L | I2B | I2C
        | I2S | GOTO | RET | RETURN | NEWARRAY | ANEWARRAY | ARRAYLENGTH | CHECKCAST
        | INSTANCEOF | LALOAD | DALOAD | GOTO_W => 0,
        ACONST_NULL..=ICONST_5 | FCONST_0..=FCONST_2 | BIPUSH | SIPUSH | LDC | LDC_W => 1,
        LCONST_0 | LCONST_1 | DCONST_0 | DCONST_1 | LDC2_W => 2,
        ILOAD | FLOAD | ALOAD => 1,
        LLOAD | DLOAD => 2,
        26..=29 | 34..=37 | 42..=45 => 1,
        30..=33 | 38..=41 => 2,
        IALOAD | FALOAD | AALOAD | BALOAD | CALOAD | SALOAD => -1,
        ISTORE | FSTORE | ASTORE => -1,
        LSTORE | DSTORE => -2,
        59..=62 | 67..=70 | 75..=78 => -1,
        63..=66 | 71..=74 => -2,
        IASTORE | FASTORE | AASTORE | BASTORE | CASTORE | SASTORE => -3,
        LASTORE | DASTORE => -4,
        POP => -1,
        POP2 => -2,
        DUP | DUP_X1 | DUP_X2 => 1,
        DUP2 | DUP2_X1 | DUP2_X2 => 2,
        IADD | FADD | ISUB | FSUB | IMUL | FMUL | IDIV | FDIV | IREM | FREM => -1,
        LADD | DADD | LSUB | DSUB | LMUL | DMUL | LDIV | DDIV | LREM | DREM => -2,
        ISHL | LSHL | ISHR | LSHR | IUSHR | LUSHR => -1,
        IAND | IOR | IXOR => -1,
        LAND | LOR | LXOR => -2,
        I2L | I2D | F2L | F2D => 1,
        L2I | L2F | D2I | D2F => -1,
        LCMP | DCMPL | DCMPG => -3,
        FCMPL | FCMPG => -1,
        IFEQ..=IFLE => -1,
        IF_ICMPEQ..=IF_ACMPNE => -2,
        JSR | JSR_W => 1,
        TABLESWITCH | LOOKUPSWITCH => -1,
        IRETURN | FRETURN | ARETURN => -1,
        LRETURN | DRETURN => -2,
        NEW => 1,
        ATHROW => -1,
        MONITORENTER | MONITOREXIT => -1,
        IFNULL | IFNONNULL => -1,
        _ => VARIABLE_DELTA,
    }
}

/// Fixed operand stack delta (in slots), indexed by opcode
///
/// Field, method, and `multianewarray` instructions have [`VARIABLE_DELTA`] since their effect
/// depends on descriptors.
pub const STACK_DELTAS: [i8; 256] = {
    let mut table = [VARIABLE_DELTA; 256];
    let mut opcode = 0;
    while opcode < 256 {
        table[opcode] = stack_delta_of(opcode as u8);
        opcode += 1;
    }
    table
};

/// Mnemonics of all real opcodes, in order
pub const MNEMONICS: [&str; 202] = [
    "nop", "aconst_null", "iconst_m1", "iconst_0", "iconst_1", "iconst_2", "iconst_3",
    "iconst_4", "iconst_5", "lconst_0", "lconst_1", "fconst_0", "fconst_1", "fconst_2",
    "dconst_0", "dconst_1", "bipush", "sipush", "ldc", "ldc_w", "ldc2_w", "iload", "lload",
    "fload", "dload", "aload", "iload_0", "iload_1", "iload_2", "iload_3", "lload_0", "lload_1",
    "lload_2", "lload_3", "fload_0", "fload_1", "fload_2", "fload_3", "dload_0", "dload_1",
    "dload_2", "dload_3", "aload_0", "aload_1", "aload_2", "aload_3", "iaload", "laload",
    "faload", "daload", "aaload", "baload", "caload", "saload", "istore", "lstore", "fstore",
    "dstore", "astore", "istore_0", "istore_1", "istore_2", "istore_3", "lstore_0", "lstore_1",
    "lstore_2", "lstore_3", "fstore_0", "fstore_1", "fstore_2", "fstore_3", "dstore_0",
    "dstore_1", "dstore_2", "dstore_3", "astore_0", "astore_1", "astore_2", "astore_3",
    "iastore", "lastore", "fastore", "dastore", "aastore", "bastore", "castore", "sastore", "pop",
    "pop2", "dup", "dup_x1", "dup_x2", "dup2", "dup2_x1", "dup2_x2", "swap", "iadd", "ladd",
    "fadd", "dadd", "isub", "lsub", "fsub", "dsub", "imul", "lmul", "fmul", "dmul", "idiv", "ldiv",
    "fdiv", "ddiv", "irem", "lrem", "frem", "drem", "ineg", "lneg", "fneg", "dneg", "ishl", "lshl",
    "ishr", "lshr", "iushr", "lushr", "iand", "land", "ior", "lor", "ixor", "lxor", "iinc", "i2l",
    "i2f", "i2d", "l2i", "l2f", "l2d", "f2i", "f2l", "f2d", "d2i", "d2l", "d2f", "i2b", "i2c",
    "i2s", "lcmp", "fcmpl", "fcmpg", "dcmpl", "dcmpg", "ifeq", "ifne", "iflt", "ifge", "ifgt",
    "ifle", "if_icmpeq", "if_icmpne", "if_icmplt", "if_icmpge", "if_icmpgt", "if_icmple",
    "if_acmpeq", "if_acmpne", "goto", "jsr", "ret", "tableswitch", "lookupswitch", "ireturn",
    "lreturn", "freturn", "dreturn", "areturn", "return", "getstatic", "putstatic", "getfield",
    "putfield", "invokevirtual", "invokespecial", "invokestatic", "invokeinterface",
    "invokedynamic", "new", "newarray", "anewarray", "arraylength", "athrow", "checkcast",
    "instanceof", "monitorenter", "monitorexit", "wide", "multianewarray", "ifnull", "ifnonnull",
    "goto_w", "jsr_w",
];

/// Mnemonic of a real opcode
pub fn mnemonic(opcode: u8) -> &'static str {
    MNEMONICS.get(opcode as usize).copied().unwrap_or("<invalid>")
}

/// Find the opcode with the given mnemonic
pub fn from_mnemonic(name: &str) -> Option<u8> {
    MNEMONICS
        .iter()
        .position(|mnemonic| *mnemonic == name)
        .map(|opcode| opcode as u8)
}

/// Opcode testing the opposite condition (eg. `ifne` for `ifeq`)
///
/// Only meaningful for conditional jumps. Conditions come in complementary pairs that differ
/// only in their lowest bit, once the pairs are aligned to even numbers.
pub const fn invert_condition(opcode: u8) -> u8 {
    if opcode <= IF_ACMPNE {
        ((opcode + 1) ^ 1) - 1
    } else {
        opcode ^ 1
    }
}

/// Marker opcode for a 16-bit jump whose offset overflowed
pub const fn oversized_marker(opcode: u8) -> u8 {
    if opcode <= JSR {
        opcode + 49
    } else {
        opcode + 20
    }
}

/// Real opcode for an oversized jump marker
pub const fn unmark_oversized(marker: u8) -> u8 {
    if marker < 218 {
        marker - 49
    } else {
        marker - 20
    }
}

/// Is this one of the `xreturn` instructions or `athrow`?
pub const fn is_exit(opcode: u8) -> bool {
    matches!(opcode, IRETURN..=RETURN | ATHROW)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mnemonics_line_up() {
        assert_eq!(mnemonic(ALOAD_3), "aload_3");
        assert_eq!(mnemonic(INVOKEDYNAMIC), "invokedynamic");
        assert_eq!(mnemonic(JSR_W), "jsr_w");
        assert_eq!(from_mnemonic("lookupswitch"), Some(LOOKUPSWITCH));
        assert_eq!(from_mnemonic("astore_3"), Some(ASTORE_3));
        assert_eq!(from_mnemonic("bogus"), None);
    }

    #[test]
    fn inverted_conditions() {
        assert_eq!(invert_condition(IFEQ), IFNE);
        assert_eq!(invert_condition(IFNE), IFEQ);
        assert_eq!(invert_condition(IFLT), IFGE);
        assert_eq!(invert_condition(IFGT), IFLE);
        assert_eq!(invert_condition(IF_ICMPLT), IF_ICMPGE);
        assert_eq!(invert_condition(IF_ACMPEQ), IF_ACMPNE);
        assert_eq!(invert_condition(IFNULL), IFNONNULL);
        assert_eq!(invert_condition(IFNONNULL), IFNULL);
    }

    #[test]
    fn oversized_markers_round_trip() {
        for opcode in (IFEQ..=JSR).chain([IFNULL, IFNONNULL]) {
            let marker = oversized_marker(opcode);
            assert_eq!(SHAPES[marker as usize], InsnShape::OversizedJump);
            assert_eq!(unmark_oversized(marker), opcode);
        }
    }

    #[test]
    fn shapes_and_deltas() {
        assert_eq!(SHAPES[ILOAD_0 as usize], InsnShape::ImplicitVar);
        assert_eq!(SHAPES[RET as usize], InsnShape::Var);
        assert_eq!(SHAPES[MULTIANEWARRAY as usize], InsnShape::MultiANewArray);
        assert_eq!(SHAPES[250], InsnShape::Invalid);
        assert_eq!(STACK_DELTAS[LCMP as usize], -3);
        assert_eq!(STACK_DELTAS[DUP2_X2 as usize], 2);
        assert_eq!(STACK_DELTAS[INVOKEVIRTUAL as usize], VARIABLE_DELTA);
    }
}
