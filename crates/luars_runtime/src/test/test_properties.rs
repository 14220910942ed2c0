// Property tests: random mutator programs interleaved with collector steps
use proptest::prelude::*;

use crate::gc::GcRef;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaVM, StackRef};
use crate::test::new_vm;

const SLOTS: u8 = 8;

#[derive(Debug, Clone)]
enum Op {
    NewTable(u8),
    NewString(u8, u16),
    NewUserdata(u8, u8),
    /// root[a].link = root[b]
    Link(u8, u8),
    Clear(u8),
    Push(u8),
    Pop,
    Step(u16),
    FullCollect,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..SLOTS).prop_map(Op::NewTable),
        2 => (0..SLOTS, any::<u16>()).prop_map(|(s, n)| Op::NewString(s, n)),
        1 => (0..SLOTS, 0u8..64).prop_map(|(s, n)| Op::NewUserdata(s, n)),
        3 => (0..SLOTS, 0..SLOTS).prop_map(|(a, b)| Op::Link(a, b)),
        2 => (0..SLOTS).prop_map(Op::Clear),
        1 => (0..SLOTS).prop_map(Op::Push),
        1 => Just(Op::Pop),
        4 => (1u16..2048).prop_map(Op::Step),
        1 => Just(Op::FullCollect),
    ]
}

fn slot_key(slot: u8) -> LuaValue {
    LuaValue::from(slot as i32 + 1)
}

fn apply(vm: &mut LuaVM, root: GcRef, link: LuaValue, op: &Op) {
    let main = vm.main_thread();
    match *op {
        Op::NewTable(s) => {
            let t = vm.create_table(0, 2).unwrap();
            vm.table_set(root, slot_key(s), LuaValue::Table(t)).unwrap();
        }
        Op::NewString(s, n) => {
            let r = vm.create_string(&format!("str{}", n)).unwrap();
            vm.table_set(root, slot_key(s), LuaValue::String(r)).unwrap();
        }
        Op::NewUserdata(s, n) => {
            let u = vm.create_userdata(n as usize, 0).unwrap();
            vm.table_set(root, slot_key(s), LuaValue::Userdata(u)).unwrap();
        }
        Op::Link(a, b) => {
            if let LuaValue::Table(t) = vm.table_get(root, &slot_key(a)).unwrap() {
                let target = vm.table_get(root, &slot_key(b)).unwrap();
                vm.table_set(t, link, target).unwrap();
            }
        }
        Op::Clear(s) => vm.table_set(root, slot_key(s), LuaValue::Nil).unwrap(),
        Op::Push(s) => {
            let value = vm.table_get(root, &slot_key(s)).unwrap();
            vm.push_value(main, value).unwrap();
        }
        Op::Pop => {
            if vm.arg_count(main).unwrap() > 0 {
                vm.pop(main, 1).unwrap();
            }
        }
        Op::Step(budget) => {
            vm.step(budget as usize).unwrap();
        }
        Op::FullCollect => vm.full_collect().unwrap(),
    }
}

/// Every object reachable from the root table is still alive.
fn assert_reachable_alive(vm: &LuaVM, root: GcRef, link: LuaValue) {
    for s in 0..SLOTS {
        let value = vm.table_get(root, &slot_key(s)).unwrap();
        if let Some(r) = value.as_gc_ref() {
            assert!(vm.is_alive(r), "slot {} holds a dead object", s);
        }
        if let LuaValue::Table(t) = value {
            if let Some(r) = vm.table_get(t, &link).unwrap().as_gc_ref() {
                assert!(vm.is_alive(r), "link of slot {} is dead", s);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn heap_invariant_holds_under_random_mutation(ops in prop::collection::vec(op(), 1..200)) {
        let mut vm = new_vm();
        vm.set_step_size(128);
        let root = vm.create_table(SLOTS as usize, 0).unwrap();
        vm.registry_ref(LuaValue::Table(root)).unwrap();
        let link = LuaValue::String(vm.create_string("link").unwrap());
        vm.registry_ref(link).unwrap();

        for op in &ops {
            apply(&mut vm, root, link, op);
            prop_assert!(vm.verify_heap().is_ok(), "heap invalid after {:?}", op);
            assert_reachable_alive(&vm, root, link);
        }

        vm.full_collect().unwrap();
        prop_assert!(vm.verify_heap().is_ok());
        assert_reachable_alive(&vm, root, link);
        prop_assert!(!vm.is_aborted());
    }

    #[test]
    fn stack_slots_survive_reallocation(
        values in prop::collection::vec(-1000i32..1000, 1..60),
        grows in prop::collection::vec(1usize..5000, 1..6),
    ) {
        let mut vm = new_vm();
        let main = vm.main_thread();
        let mut slots = Vec::with_capacity(values.len());
        for &v in &values {
            vm.push_value(main, LuaValue::from(v)).unwrap();
            let index = vm.top(main).unwrap() - 1;
            slots.push((StackRef { thread: main, index }, v));
        }
        let uv = vm.find_upvalue(main, slots[0].0.index).unwrap();

        for &n in &grows {
            vm.grow_stack(main, n).unwrap();
            for &(slot, v) in &slots {
                prop_assert_eq!(vm.stack_get(slot).unwrap(), LuaValue::from(v));
            }
            prop_assert_eq!(vm.get_upvalue_value(uv).unwrap(), LuaValue::from(values[0]));
        }
        prop_assert!(vm.verify_heap().is_ok());
    }
}
