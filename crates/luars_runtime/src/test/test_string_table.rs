// Tests for string interning
use crate::gc::{GcObjectKind, GcState};
use crate::lua_value::LuaValue;
use crate::test::new_vm;

#[test]
fn test_duplicates_share_one_object() {
    let mut vm = new_vm();
    let memcat = 7;
    let strings = vm.string_count();
    let prev = vm.set_memory_category(memcat);

    let mut refs = Vec::with_capacity(1000);
    for i in 0..1000 {
        refs.push(vm.create_string(&format!("key_{}", i)).unwrap());
    }
    let total = vm.total_bytes();
    let cat = vm.memory_category_bytes(memcat);
    assert!(cat > 0);
    assert_eq!(vm.string_count(), strings + 1000);

    for (i, &r) in refs.iter().enumerate() {
        assert_eq!(vm.create_string(&format!("key_{}", i)).unwrap(), r);
    }
    vm.set_memory_category(prev);

    assert_eq!(vm.string_count(), strings + 1000);
    assert_eq!(vm.total_bytes(), total);
    assert_eq!(vm.memory_category_bytes(memcat), cat);
    assert!(vm.heap.strings.bucket_count() >= 1000);
}

#[test]
fn test_dead_strings_are_unlinked() {
    let mut vm = new_vm();
    vm.full_collect().unwrap();
    let strings = vm.string_count();
    let string_bytes = vm.kind_bytes(GcObjectKind::String);

    let keep = vm.create_string("kept").unwrap();
    vm.registry_ref(LuaValue::String(keep)).unwrap();
    for i in 0..2000 {
        vm.create_string(&format!("temp_{}", i)).unwrap();
    }
    let peak = vm.heap.strings.bucket_count();

    vm.full_collect().unwrap();
    assert_eq!(vm.string_count(), strings + 1);
    assert!(vm.is_alive(keep));
    assert!(vm.kind_bytes(GcObjectKind::String) > string_bytes);
    assert!(vm.heap.strings.bucket_count() < peak);

    // a sparse table keeps shrinking on later cycles
    for _ in 0..8 {
        vm.full_collect().unwrap();
    }
    assert!(vm.heap.strings.bucket_count() <= peak / 4);

    // a collected string can be created again
    let again = vm.create_string("temp_5").unwrap();
    assert_eq!(vm.string(again).unwrap().as_bytes(), b"temp_5");
    assert_eq!(vm.string_count(), strings + 2);
}

#[test]
fn test_dead_string_is_resurrected_before_sweep() {
    let mut vm = new_vm();
    let s = vm.create_string("resurrected string").unwrap();

    let mut guard = 0;
    while vm.gc_state() != GcState::Sweep {
        guard += 1;
        assert!(guard < 100_000);
        vm.step(1).unwrap();
    }
    // marked dead by the flip, not swept yet
    assert!(!vm.is_alive(s));

    let again = vm.create_string("resurrected string").unwrap();
    assert_eq!(again, s);
    assert!(vm.is_alive(s));

    while vm.gc_state() != GcState::Pause {
        vm.step(1024).unwrap();
    }
    assert!(vm.is_alive(s));
    assert_eq!(vm.to_str(&LuaValue::String(s)), Some("resurrected string"));
    vm.verify_heap().unwrap();
}

#[test]
fn test_arbitrary_bytes() {
    let mut vm = new_vm();
    let raw = vm.create_bytes(&[0xff, 0xfe, 0x00, 0x41]).unwrap();
    assert_eq!(vm.create_bytes(&[0xff, 0xfe, 0x00, 0x41]).unwrap(), raw);
    assert_ne!(vm.create_bytes(&[0xff, 0xfe, 0x00]).unwrap(), raw);

    let s = vm.string(raw).unwrap();
    assert_eq!(s.len(), 4);
    assert_eq!(s.as_str(), None);
    assert_eq!(vm.to_str(&LuaValue::String(raw)), None);

    let empty = vm.create_string("").unwrap();
    assert!(vm.string(empty).unwrap().is_empty());
    assert_eq!(vm.create_bytes(&[]).unwrap(), empty);
}

#[test]
fn test_fixed_names_survive_collection() {
    let mut vm = new_vm();
    let index = vm.const_strings().tm(crate::lua_vm::TmKind::Index);
    let table = vm.const_strings().type_name(crate::lua_value::LuaType::Table);
    for _ in 0..3 {
        vm.full_collect().unwrap();
    }
    assert_eq!(vm.to_str(&index), Some("__index"));
    assert_eq!(vm.to_str(&table), Some("table"));
    let r = index.as_gc_ref().unwrap();
    assert!(vm.heap.header(r).unwrap().is_fixed());
    assert_eq!(vm.create_string("__index").unwrap(), r);
}
