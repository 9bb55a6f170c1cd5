//! Reference lifetime checker
//!
//! Runs a fixed set of lifetime scenarios against every backend and reports
//! leaked roots. Exits nonzero if any backend leaks.

use napi_bridge::{Backend, Env, Status, Value, Vm};

fn main() {
    env_logger::init();

    let mut failures = 0;
    for backend in [Backend::Protect, Backend::RefCount, Backend::RootList] {
        println!("== backend {:?} ==", backend);
        for (name, scenario) in scenarios() {
            match run(backend, scenario) {
                Ok(leaked) if leaked == 0 => println!("  {:<32} ok", name),
                Ok(leaked) => {
                    println!("  {:<32} LEAKED {} root(s)", name, leaked);
                    failures += 1;
                }
                Err(status) => {
                    println!("  {:<32} FAILED: {}", name, status);
                    failures += 1;
                }
            }
        }
    }

    if failures > 0 {
        eprintln!("{} scenario(s) failed", failures);
        std::process::exit(1);
    }
}

type Scenario = fn(&mut Env) -> Result<(), Status>;

fn scenarios() -> Vec<(&'static str, Scenario)> {
    vec![
        ("reference churn", reference_churn),
        ("weak after collect", weak_after_collect),
        ("nested scopes", nested_scopes),
        ("escape chain", escape_chain),
        ("throw and recover", throw_and_recover),
    ]
}

fn run(backend: Backend, scenario: Scenario) -> Result<usize, Status> {
    let vm = Vm::new(backend);
    let mut env = vm.create_env();
    scenario(&mut env)?;
    Ok(env.free().leaked_retains)
}

fn reference_churn(env: &mut Env) -> Result<(), Status> {
    let scope = env.open_handle_scope()?;
    for _ in 0..100 {
        let obj = env.create_object()?;
        let id = env.create_reference(obj, 1)?;
        env.reference_ref(id)?;
        env.reference_unref(id)?;
        env.delete_reference(id)?;
    }
    env.close_handle_scope(scope)?;
    env.run_gc();
    Ok(())
}

fn weak_after_collect(env: &mut Env) -> Result<(), Status> {
    let scope = env.open_handle_scope()?;
    let obj = env.create_object()?;
    let id = env.create_reference(obj, 0)?;
    env.close_handle_scope(scope)?;
    env.run_gc();
    if !env.reference_value(id)?.is_undefined() {
        return Err(Status::GenericFailure);
    }
    env.delete_reference(id)
}

fn nested_scopes(env: &mut Env) -> Result<(), Status> {
    let outer = env.open_handle_scope()?;
    for _ in 0..10 {
        let inner = env.open_handle_scope()?;
        let obj = env.create_object()?;
        env.set_named_property(obj, "n", Value::Int(7))?;
        env.close_handle_scope(inner)?;
    }
    env.close_handle_scope(outer)
}

fn escape_chain(env: &mut Env) -> Result<(), Status> {
    let outer = env.open_handle_scope()?;
    let mut carried = env.create_object()?;
    for _ in 0..5 {
        let inner = env.open_escapable_handle_scope()?;
        let fresh = env.create_object()?;
        env.set_named_property(fresh, "prev", carried)?;
        carried = env.escape_handle(inner, fresh)?;
        env.close_escapable_handle_scope(inner)?;
        env.run_gc();
    }
    env.close_handle_scope(outer)
}

fn throw_and_recover(env: &mut Env) -> Result<(), Status> {
    let scope = env.open_handle_scope()?;
    let err = env.create_object()?;
    env.throw(err)?;
    if env.create_object() != Err(Status::PendingException) {
        return Err(Status::GenericFailure);
    }
    let caught = env.get_and_clear_last_exception();
    if caught != err {
        return Err(Status::GenericFailure);
    }
    env.create_object()?;
    env.close_handle_scope(scope)
}
