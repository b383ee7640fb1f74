//! End-to-end decompilation tests
//!
//! Each test assembles a small NCS program with the bytecode writer, runs
//! the full pipeline, and asserts on the emitted NSS text. No external
//! compiler is configured, so the best status is partial-compile.

use ncs_actions::{ActionsData, Game};
use ncs_bytecode::{NcsWriter, Opcode, Qualifier};
use ncs_decompiler::{Config, FileDecompiler, Status};

const TABLE: &str = "\
object GetModule();
void PrintString(string sString);
void PrintInteger(int nInteger);
int GetCount(object oTarget);
void DelayCommand(float fSeconds, action aAction);
";

fn actions() -> ActionsData {
    ActionsData::parse(Game::K1, TABLE).unwrap()
}

const ACTION_PRINT_STRING: u16 = 1;
const ACTION_PRINT_INTEGER: u16 = 2;
const ACTION_GET_COUNT: u16 = 3;
const ACTION_DELAY_COMMAND: u16 = 4;

fn decompiler() -> FileDecompiler {
    FileDecompiler::new(Config::default(), Ok(actions()))
}

fn decompile(writer: NcsWriter) -> (Status, String) {
    let outcome = decompiler().decompile(&writer.into_bytes());
    (outcome.status, outcome.source)
}

#[test]
fn test_empty_body() {
    let mut writer = NcsWriter::new();
    writer.emit_retn();
    let (status, source) = decompile(writer);

    assert_eq!(status, Status::PartialCompile);
    assert!(source.contains("void main()"), "{source}");
    assert!(!source.contains("ERROR"), "{source}");
}

#[test]
fn test_void_action_call() {
    let mut writer = NcsWriter::new();
    writer.emit_const_string("Hello");
    writer.emit_action(ACTION_PRINT_STRING, 1);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains("void main()"), "{source}");
    assert!(source.contains("PrintString(\"Hello\");"), "{source}");
}

#[test]
fn test_if_else() {
    // int i = 0; if (i == 5) PrintString("a"); else PrintString("b");
    let mut writer = NcsWriter::new();
    writer.emit_const_int(0);
    writer.emit_cptopsp(-4, 4);
    writer.emit_const_int(5);
    writer.emit_binop(Opcode::Eq, Qualifier::IntInt);
    let jz = writer.reserve_jump(Opcode::Jz);
    writer.emit_const_string("a");
    writer.emit_action(ACTION_PRINT_STRING, 1);
    let skip_else = writer.reserve_jump(Opcode::Jmp);
    let else_start = writer.here();
    writer.patch_jump(jz, else_start);
    writer.emit_const_string("b");
    writer.emit_action(ACTION_PRINT_STRING, 1);
    let end = writer.here();
    writer.patch_jump(skip_else, end);
    writer.emit_movsp(-4);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains("int int1 = 0;"), "{source}");
    assert!(source.contains("if (int1 == 5) {"), "{source}");
    assert!(source.contains("} else {"), "{source}");
    assert!(source.contains("PrintString(\"a\");"), "{source}");
    assert!(source.contains("PrintString(\"b\");"), "{source}");
}

#[test]
fn test_while_loop_not_do_while() {
    // int i = 1; while (i) PrintString("x");
    let mut writer = NcsWriter::new();
    writer.emit_const_int(1);
    let head = writer.here();
    writer.emit_cptopsp(-4, 4);
    let exit = writer.reserve_jump(Opcode::Jz);
    writer.emit_const_string("x");
    writer.emit_action(ACTION_PRINT_STRING, 1);
    writer.emit_jump_to(Opcode::Jmp, head);
    let end = writer.here();
    writer.patch_jump(exit, end);
    writer.emit_movsp(-4);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains("while (int1) {"), "{source}");
    assert!(!source.contains("do {"), "{source}");
    assert!(source.contains("PrintString(\"x\");"), "{source}");
}

#[test]
fn test_do_while_loop() {
    // do { PrintString("x"); } while (0);
    let mut writer = NcsWriter::new();
    let head = writer.here();
    writer.emit_const_string("x");
    writer.emit_action(ACTION_PRINT_STRING, 1);
    writer.emit_const_int(0);
    writer.emit_jump_to(Opcode::Jnz, head);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains("do {"), "{source}");
    assert!(source.contains("} while (0);"), "{source}");
}

#[test]
fn test_switch_with_default() {
    // int i = 2; switch (i) { case 1.. case 2.. case 3.. default.. }
    let mut writer = NcsWriter::new();
    writer.emit_const_int(2);
    writer.emit_cptopsp(-4, 4); // discriminant

    let mut case_exits = Vec::new();
    let mut next_test = None;
    for value in [1, 2, 3] {
        if let Some(fixup) = next_test.take() {
            writer.patch_jump(fixup, writer.here());
        }
        writer.emit_cptopsp(-4, 4);
        writer.emit_const_int(value);
        writer.emit_binop(Opcode::Eq, Qualifier::IntInt);
        let miss = writer.reserve_jump(Opcode::Jz);
        writer.emit_const_string(&format!("c{value}"));
        writer.emit_action(ACTION_PRINT_STRING, 1);
        case_exits.push(writer.reserve_jump(Opcode::Jmp));
        next_test = Some(miss);
    }
    // Default body.
    if let Some(fixup) = next_test.take() {
        writer.patch_jump(fixup, writer.here());
    }
    writer.emit_const_string("dflt");
    writer.emit_action(ACTION_PRINT_STRING, 1);

    let end = writer.here();
    for fixup in case_exits {
        writer.patch_jump(fixup, end);
    }
    writer.emit_movsp(-4); // pop discriminant
    writer.emit_movsp(-4); // pop i
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains("switch (int1) {"), "{source}");
    let c1 = source.find("case 1:").expect("case 1");
    let c2 = source.find("case 2:").expect("case 2");
    let c3 = source.find("case 3:").expect("case 3");
    let dflt = source.find("default:").expect("default");
    assert!(c1 < c2 && c2 < c3 && c3 < dflt, "{source}");
    assert!(source.contains("PrintString(\"dflt\");"), "{source}");
    assert!(source.contains("break;"), "{source}");
}

#[test]
fn test_subroutine_call_and_return() {
    // int helper(int p) { return p + 1; }  main: int n = helper(3);
    let mut writer = NcsWriter::new();
    let jsr_main = writer.reserve_jump(Opcode::Jsr);
    writer.emit_retn();

    let main = writer.here();
    writer.patch_jump(jsr_main, main);
    writer.emit_rsadd(Qualifier::Int); // return slot
    writer.emit_const_int(3);
    let jsr_helper = writer.reserve_jump(Opcode::Jsr);
    writer.emit_movsp(-4); // drop the result
    writer.emit_retn();

    let helper = writer.here();
    writer.patch_jump(jsr_helper, helper);
    writer.emit_cptopsp(-4, 4); // read the parameter
    writer.emit_const_int(1);
    writer.emit_binop(Opcode::Add, Qualifier::IntInt);
    writer.emit_cpdownsp(-12, 4); // write the return slot
    writer.emit_movsp(-4);
    writer.emit_movsp(-4); // pop the parameter
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains("int sub2(int param1);"), "{source}");
    assert!(source.contains("return param1 + 1;"), "{source}");
    assert!(source.contains("int int1 = sub2(3);"), "{source}");
    // main prints after the helper body
    let helper_pos = source.find("int sub2(int param1) {").expect("helper body");
    let main_pos = source.find("void main() {").expect("main body");
    assert!(helper_pos < main_pos, "{source}");
}

#[test]
fn test_vector_return_field_select() {
    // float f = getvec().y;
    let mut writer = NcsWriter::new();
    let jsr_main = writer.reserve_jump(Opcode::Jsr);
    writer.emit_retn();

    let main = writer.here();
    writer.patch_jump(jsr_main, main);
    writer.emit_rsadd(Qualifier::Float); // f
    writer.emit_rsadd(Qualifier::Float); // return slots
    writer.emit_rsadd(Qualifier::Float);
    writer.emit_rsadd(Qualifier::Float);
    let jsr_vec = writer.reserve_jump(Opcode::Jsr);
    writer.emit_destruct(12, 4, 4); // keep the middle component
    writer.emit_cpdownsp(-8, 4); // store into f
    writer.emit_movsp(-4); // pop the component
    writer.emit_movsp(-4); // pop f
    writer.emit_retn();

    let getvec = writer.here();
    writer.patch_jump(jsr_vec, getvec);
    writer.emit_const_float(1.0);
    writer.emit_const_float(2.0);
    writer.emit_const_float(3.0);
    writer.emit_cpdownsp(-24, 12);
    writer.emit_movsp(-12);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains(".y;"), "{source}");
    // exactly one declaration in main
    let main_body = &source[source.find("void main() {").unwrap()..];
    assert_eq!(main_body.matches("float ").count(), 1, "{source}");
}

#[test]
fn test_starting_conditional() {
    let mut writer = NcsWriter::new();
    writer.emit_rsadd(Qualifier::Int);
    let jsr = writer.reserve_jump(Opcode::Jsr);
    writer.emit_retn();
    let main = writer.here();
    writer.patch_jump(jsr, main);
    writer.emit_const_int(1);
    writer.emit_cpdownsp(-8, 4);
    writer.emit_movsp(-4);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains("int StartingConditional() {"), "{source}");
    assert!(source.contains("return 1;"), "{source}");
}

#[test]
fn test_globals_frame() {
    // int g = 7; main: PrintInteger(g);
    let mut writer = NcsWriter::new();
    writer.emit_const_int(7);
    writer.emit_savebp();
    let jsr = writer.reserve_jump(Opcode::Jsr);
    writer.emit_restorebp();
    writer.emit_movsp(-4);
    writer.emit_retn();
    let main = writer.here();
    writer.patch_jump(jsr, main);
    writer.emit_cptopbp(-4, 4);
    writer.emit_action(ACTION_PRINT_INTEGER, 1);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains("int int1 = 7;"), "{source}");
    assert!(source.contains("PrintInteger(int1);"), "{source}");
    // the global declaration precedes main
    assert!(source.find("int int1 = 7;").unwrap() < source.find("void main()").unwrap());
}

#[test]
fn test_deferred_action_argument() {
    // DelayCommand(2.0, PrintString("x"));
    let mut writer = NcsWriter::new();
    writer.emit_store_state(0, 0);
    let bracket = writer.reserve_jump(Opcode::Jmp);
    writer.emit_const_string("x");
    writer.emit_action(ACTION_PRINT_STRING, 1);
    writer.emit_retn();
    let after = writer.here();
    writer.patch_jump(bracket, after);
    writer.emit_const_float(2.0);
    writer.emit_action(ACTION_DELAY_COMMAND, 2);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(
        source.contains("DelayCommand(2.0, PrintString(\"x\"));"),
        "{source}"
    );
}

#[test]
fn test_heuristic_variable_name() {
    // int nCount = GetCount(GetModule());  (declared then assigned)
    let mut writer = NcsWriter::new();
    writer.emit_rsadd(Qualifier::Int);
    writer.emit_const_object(0); // OBJECT_SELF
    writer.emit_action(ACTION_GET_COUNT, 1);
    writer.emit_cpdownsp(-8, 4);
    writer.emit_movsp(-4);
    writer.emit_movsp(-4);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains("int nCount = GetCount(OBJECT_SELF);"), "{source}");
}

#[test]
fn test_postfix_increment_statement() {
    let mut writer = NcsWriter::new();
    writer.emit_const_int(5);
    writer.emit_cptopsp(-4, 4);
    writer.emit_stack_mod(Opcode::IncISp, -8);
    writer.emit_movsp(-4);
    writer.emit_movsp(-4);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains("int int1 = 5;"), "{source}");
    assert!(source.contains("int1++;"), "{source}");
}

#[test]
fn test_prefix_increment_expression() {
    // int int1 = 5; int int2 = ++int1;
    let mut writer = NcsWriter::new();
    writer.emit_const_int(5);
    writer.emit_rsadd(Qualifier::Int);
    writer.emit_stack_mod(Opcode::IncISp, -8);
    writer.emit_cptopsp(-8, 4);
    writer.emit_cpdownsp(-8, 4);
    writer.emit_movsp(-4);
    writer.emit_movsp(-8);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains("int int1 = 5;"), "{source}");
    assert!(source.contains("int int2 = ++int1;"), "{source}");
}

#[test]
fn test_missing_action_table_stub() {
    let err = ActionsData::locate(Game::K1, None, &[]).unwrap_err();
    let decompiler = FileDecompiler::new(Config::default(), Err(err));

    let mut writer = NcsWriter::new();
    writer.emit_retn();
    let outcome = decompiler.decompile(&writer.into_bytes());

    assert_eq!(outcome.status, Status::Failure);
    assert!(
        outcome.source.contains("// ACTIONS DATA LOADING FAILURE"),
        "{}",
        outcome.source
    );
    assert!(outcome.source.contains("void main() {}"), "{}", outcome.source);
}

#[test]
fn test_invalid_signature_stub() {
    let mut bytes = NcsWriter::new().into_bytes();
    bytes[0] = b'X';
    let outcome = decompiler().decompile(&bytes);

    assert_eq!(outcome.status, Status::Failure);
    assert!(
        outcome.source.contains("// Invalid NCS signature"),
        "{}",
        outcome.source
    );
    assert!(outcome.source.contains("void main() {}"), "{}", outcome.source);
}

#[test]
fn test_stack_underflow_recovery() {
    // ADD with nothing useful on the stack, then a healthy statement.
    let mut writer = NcsWriter::new();
    writer.emit_const_int(1);
    writer.emit_binop(Opcode::Add, Qualifier::IntInt);
    writer.emit_const_string("after");
    writer.emit_action(ACTION_PRINT_STRING, 1);
    writer.emit_retn();
    let (status, source) = decompile(writer);

    assert_ne!(status, Status::Failure);
    assert!(
        source.contains("// ERROR: failed to decompile statement at"),
        "{source}"
    );
    assert!(source.contains("PrintString(\"after\");"), "{source}");
}

#[test]
fn test_idempotent_output() {
    let build = || {
        let mut writer = NcsWriter::new();
        writer.emit_const_int(0);
        writer.emit_cptopsp(-4, 4);
        writer.emit_const_int(5);
        writer.emit_binop(Opcode::Eq, Qualifier::IntInt);
        let jz = writer.reserve_jump(Opcode::Jz);
        writer.emit_const_string("a");
        writer.emit_action(ACTION_PRINT_STRING, 1);
        let target = writer.here();
        writer.patch_jump(jz, target);
        writer.emit_movsp(-4);
        writer.emit_retn();
        writer.into_bytes()
    };
    let first = decompiler().decompile(&build());
    let second = decompiler().decompile(&build());
    assert_eq!(first.source, second.source);
}

#[test]
fn test_break_inside_while() {
    // int i = 1; while (i) { if (i < 3) break; PrintString("loop"); }
    // PrintString("done");
    let mut writer = NcsWriter::new();
    writer.emit_const_int(1);
    let head = writer.here();
    writer.emit_cptopsp(-4, 4);
    let exit_jz = writer.reserve_jump(Opcode::Jz);
    writer.emit_cptopsp(-4, 4);
    writer.emit_const_int(3);
    writer.emit_binop(Opcode::Lt, Qualifier::IntInt);
    let skip_if = writer.reserve_jump(Opcode::Jz);
    let brk = writer.reserve_jump(Opcode::Jmp);
    let after_if = writer.here();
    writer.patch_jump(skip_if, after_if);
    writer.emit_const_string("loop");
    writer.emit_action(ACTION_PRINT_STRING, 1);
    writer.emit_jump_to(Opcode::Jmp, head);
    let exit = writer.here();
    writer.patch_jump(exit_jz, exit);
    writer.patch_jump(brk, exit);
    writer.emit_const_string("done");
    writer.emit_action(ACTION_PRINT_STRING, 1);
    writer.emit_movsp(-4);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains("while (int1) {"), "{source}");
    assert!(source.contains("if (int1 < 3) {"), "{source}");
    assert!(source.contains("break;"), "{source}");
    assert!(source.contains("PrintString(\"loop\");"), "{source}");
    assert!(source.contains("PrintString(\"done\");"), "{source}");
}

#[test]
fn test_logical_connective_condition() {
    // int i = 1; if (i < 3 && i > 0) PrintString("in");
    let mut writer = NcsWriter::new();
    writer.emit_const_int(1);
    writer.emit_cptopsp(-4, 4);
    writer.emit_const_int(3);
    writer.emit_binop(Opcode::Lt, Qualifier::IntInt);
    writer.emit_cptopsp(-8, 4);
    writer.emit_const_int(0);
    writer.emit_binop(Opcode::Gt, Qualifier::IntInt);
    writer.emit_binop(Opcode::LogAnd, Qualifier::IntInt);
    let jz = writer.reserve_jump(Opcode::Jz);
    writer.emit_const_string("in");
    writer.emit_action(ACTION_PRINT_STRING, 1);
    let end = writer.here();
    writer.patch_jump(jz, end);
    writer.emit_movsp(-4);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(source.contains("if (int1 < 3 && int1 > 0) {"), "{source}");
    assert!(source.contains("PrintString(\"in\");"), "{source}");
}

#[test]
fn test_dead_code_is_skipped() {
    let mut writer = NcsWriter::new();
    let skip = writer.reserve_jump(Opcode::Jmp);
    writer.emit_const_string("dead");
    writer.emit_action(ACTION_PRINT_STRING, 1);
    let target = writer.here();
    writer.patch_jump(skip, target);
    writer.emit_const_string("live");
    writer.emit_action(ACTION_PRINT_STRING, 1);
    writer.emit_retn();
    let (_, source) = decompile(writer);

    assert!(!source.contains("dead"), "{source}");
    assert!(source.contains("PrintString(\"live\");"), "{source}");
}
