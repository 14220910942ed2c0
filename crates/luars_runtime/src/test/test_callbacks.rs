// Tests for the native execution hooks
use std::cell::RefCell;
use std::rc::Rc;

use crate::gc::{GcObjectKind, GcRef, ThreadRef};
use crate::lua_value::{LuaClosure, LuaProto, LuaValue};
use crate::lua_vm::{ExecutionCallbacks, LuaError, LuaVM, StackRef};
use crate::test::{anchored_lua_function, new_vm};

const NATIVE_SIZE: usize = 4096;

#[derive(Default)]
struct Recorder {
    events: RefCell<Vec<String>>,
    finish_natively: bool,
}

impl Recorder {
    fn record(&self, event: impl Into<String>) {
        self.events.borrow_mut().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }
}

impl ExecutionCallbacks for Recorder {
    fn on_close(&self) {
        self.record("close");
    }

    fn on_destroy(&self, proto: &LuaProto) {
        self.record(format!("destroy {}", proto.max_stack_size));
    }

    fn on_enter(&self, vm: &mut LuaVM, thread: ThreadRef, _proto: GcRef) -> bool {
        let native = vm
            .thread(thread)
            .map(|l| l.current_frame().is_native())
            .unwrap_or(false);
        self.record(format!("enter native={}", native));
        if !self.finish_natively {
            return true;
        }
        let done = vm
            .set_top(thread, 0)
            .and_then(|_| vm.push_value(thread, LuaValue::from(99)));
        done.is_err()
    }

    fn on_disable(&self, proto: &LuaProto) {
        self.record(format!("disable {}", proto.max_stack_size));
    }

    fn native_memory_size(&self, _proto: &LuaProto) -> usize {
        NATIVE_SIZE
    }

    fn userdata_type_tag(&self, name: &[u8]) -> u8 {
        if name == b"Vector3" { 12 } else { 0 }
    }
}

fn install(vm: &mut LuaVM, finish_natively: bool) -> Rc<Recorder> {
    let recorder = Rc::new(Recorder {
        finish_natively,
        ..Default::default()
    });
    let callbacks: Rc<dyn ExecutionCallbacks> = recorder.clone();
    vm.set_execution_callbacks(Some(callbacks));
    recorder
}

/// Closure whose proto carries native code.
fn native_function(vm: &mut LuaVM, max_stack: u8) -> (GcRef, GcRef) {
    let closure = anchored_lua_function(vm, 1, false, max_stack);
    let proto = match vm.closure(closure).unwrap() {
        LuaClosure::Lua { proto, .. } => *proto,
        LuaClosure::Native { .. } => unreachable!(),
    };
    vm.attach_native(proto).unwrap();
    (closure, proto)
}

#[test]
fn test_native_size_is_accounted() {
    let mut vm = new_vm();
    install(&mut vm, false);
    let proto = vm.create_proto(LuaProto::new(0, false, 3)).unwrap();
    let before = vm.kind_bytes(GcObjectKind::Proto);
    let total = vm.total_bytes();

    vm.attach_native(proto).unwrap();
    assert!(vm.proto(proto).unwrap().has_native());
    assert_eq!(vm.kind_bytes(GcObjectKind::Proto), before + NATIVE_SIZE);
    assert_eq!(vm.total_bytes(), total + NATIVE_SIZE);

    vm.disable_native(proto).unwrap();
    assert!(!vm.proto(proto).unwrap().has_native());
    assert_eq!(vm.kind_bytes(GcObjectKind::Proto), before);
    assert_eq!(vm.total_bytes(), total);
    vm.verify_heap().unwrap();
}

#[test]
fn test_disable_reports_once() {
    let mut vm = new_vm();
    let recorder = install(&mut vm, false);
    let (_, proto) = native_function(&mut vm, 4);
    vm.disable_native(proto).unwrap();
    vm.disable_native(proto).unwrap();
    assert_eq!(recorder.events(), vec!["disable 4".to_string()]);
}

#[test]
fn test_attach_requires_callbacks() {
    let mut vm = new_vm();
    let proto = vm.create_proto(LuaProto::new(0, false, 1)).unwrap();
    assert_eq!(vm.attach_native(proto), Err(LuaError::RuntimeError));
    assert!(!vm.proto(proto).unwrap().has_native());
    assert_eq!(vm.userdata_tag_by_name("Vector3"), None);
}

#[test]
fn test_native_code_finishes_the_call() {
    let mut vm = new_vm();
    let recorder = install(&mut vm, true);
    let main = vm.main_thread();
    let (closure, _) = native_function(&mut vm, 4);

    let func = vm.top(main).unwrap();
    vm.push_value(main, LuaValue::Function(closure)).unwrap();
    vm.push_value(main, LuaValue::from(1)).unwrap();
    vm.call(main, 1, 1).unwrap();

    assert_eq!(vm.top(main).unwrap(), func + 1);
    let result = vm.stack_get(StackRef {
        thread: main,
        index: func,
    });
    assert_eq!(result, Ok(LuaValue::from(99)));
    assert_eq!(recorder.events(), vec!["enter native=true".to_string()]);
}

#[test]
fn test_handing_back_to_bytecode_fails_without_interpreter() {
    let mut vm = new_vm();
    let recorder = install(&mut vm, false);
    let main = vm.main_thread();
    let (closure, _) = native_function(&mut vm, 2);

    vm.push_value(main, LuaValue::Function(closure)).unwrap();
    assert!(!vm.pcall(main, 0, 0).unwrap());
    assert_eq!(vm.get_error_message(), "no interpreter attached to run bytecode");
    assert_eq!(recorder.events(), vec!["enter native=true".to_string()]);
    assert_eq!(vm.thread(main).unwrap().call_depth(), 0);
}

#[test]
fn test_plain_bytecode_skips_the_hook() {
    let mut vm = new_vm();
    let recorder = install(&mut vm, true);
    let main = vm.main_thread();
    let f = anchored_lua_function(&mut vm, 0, false, 2);

    vm.push_value(main, LuaValue::Function(f)).unwrap();
    assert!(!vm.pcall(main, 0, 0).unwrap());
    assert!(recorder.events().is_empty());
}

#[test]
fn test_destroy_and_close_notifications() {
    let mut vm = new_vm();
    let recorder = install(&mut vm, false);

    let garbage = vm.create_proto(LuaProto::new(0, false, 7)).unwrap();
    vm.attach_native(garbage).unwrap();
    let plain = vm.create_proto(LuaProto::new(0, false, 8)).unwrap();
    vm.full_collect().unwrap();
    assert!(!vm.is_alive(garbage));
    assert!(!vm.is_alive(plain));
    assert_eq!(recorder.events(), vec!["destroy 7".to_string()]);

    native_function(&mut vm, 9);
    drop(vm);
    assert_eq!(
        recorder.events(),
        vec![
            "destroy 7".to_string(),
            "destroy 9".to_string(),
            "close".to_string()
        ]
    );
}

#[test]
fn test_userdata_tag_lookup() {
    let mut vm = new_vm();
    install(&mut vm, false);
    assert_eq!(vm.userdata_tag_by_name("Vector3"), Some(12));
    assert_eq!(vm.userdata_tag_by_name("Other"), Some(0));

    let tag = vm.userdata_tag_by_name("Vector3").unwrap_or(0);
    let u = vm.create_userdata(12, tag).unwrap();
    assert_eq!(vm.userdata(u).unwrap().tag(), 12);
}
