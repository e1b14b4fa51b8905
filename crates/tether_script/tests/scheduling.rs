//! Scheduler entry points driven from JavaScript.

use tether_script::{ScriptError, ScriptRuntime};

fn eval(runtime: &ScriptRuntime, source: &str) -> String {
    runtime
        .eval_json(source)
        .unwrap_or_else(|err| panic!("script failed: {err}"))
        .unwrap_or_default()
}

#[cfg(unix)]
#[test]
fn five_processes_with_limit_two() {
    let runtime = ScriptRuntime::new().unwrap();
    let result = eval(
        &runtime,
        r#"(() => {
            let launched = 0, running = 0, peak = 0;
            const codes = [];
            const dispatched = host.taskRun(() => {
                if (launched === 5) return null;
                launched++;
                running++;
                peak = Math.max(peak, running);
                const op = host.startProcessAsync("sh", `-c "sleep 0.05; exit ${launched}"`);
                return [op, "int", (code) => { running--; codes.push(code); }];
            }, 2);
            codes.sort();
            return { dispatched, peak, codes };
        })()"#,
    );
    assert_eq!(result, r#"{"dispatched":5,"peak":2,"codes":[1,2,3,4,5]}"#);
    assert_eq!(runtime.live_callables(), 0);
    assert_eq!(runtime.pending_operations(), 0);
}

#[test]
fn huge_limits_are_accepted() {
    let runtime = ScriptRuntime::new().unwrap();
    let result = eval(
        &runtime,
        r#"(() => {
            const idle = host.taskRun(() => null, 2 ** 40);
            let first = true;
            const one = host.taskRun(() => {
                if (!first) return null;
                first = false;
                return [host.taskDelay(1), "void", () => {}];
            }, 2 ** 40);
            const batch = host.createBatchProcess(() => {});
            host.addBatchProcess(batch, "definitely-not-a-real-binary-4242");
            return [idle, one, host.runBatchProcess(batch, 2 ** 40)];
        })()"#,
    );
    assert_eq!(result, "[0,1,true]");
    assert_eq!(runtime.live_callables(), 0);
}

#[test]
fn producer_failure_after_three_items() {
    let runtime = ScriptRuntime::new().unwrap();
    let result = eval(
        &runtime,
        r#"(() => {
            let pulls = 0;
            const fired = [];
            let error = null;
            try {
                host.taskRun(() => {
                    pulls++;
                    if (pulls === 4) throw new Error("fourth pull");
                    const id = pulls;
                    return [host.taskDelay(10 * id), "void", () => fired.push(id)];
                });
            } catch (e) {
                error = e.message;
            }
            fired.sort();
            return { fired, error };
        })()"#,
    );
    assert_eq!(result, r#"{"fired":[1,2,3],"error":"fourth pull"}"#);
    assert_eq!(runtime.live_callables(), 0);
}

#[test]
fn first_callback_failure_is_rethrown_after_draining() {
    let runtime = ScriptRuntime::new().unwrap();
    let result = eval(
        &runtime,
        r#"(() => {
            let pulls = 0, calls = 0;
            let error = null;
            try {
                host.taskRun(() => {
                    if (pulls === 3) return null;
                    pulls++;
                    const id = pulls;
                    return [host.taskDelay(15 * id), "void", () => { calls++; throw new Error("callback " + id); }];
                }, 3);
            } catch (e) {
                error = e.message;
            }
            return { calls, error };
        })()"#,
    );
    assert_eq!(result, r#"{"calls":3,"error":"callback 1"}"#);
    assert_eq!(runtime.live_callables(), 0);
}

#[test]
fn operation_failure_is_passed_to_the_callback() {
    let runtime = ScriptRuntime::new().unwrap();
    let result = eval(
        &runtime,
        r#"(() => {
            let seen = null;
            let first = true;
            host.taskRun(() => {
                if (!first) return undefined;
                first = false;
                const op = host.startProcessAsync("definitely-not-a-real-binary-4242");
                return [op, "int", (value, error) => { seen = [value === undefined, typeof error]; }];
            });
            return seen;
        })()"#,
    );
    assert_eq!(result, r#"[true,"string"]"#);
}

#[cfg(unix)]
#[test]
fn result_types_decode_or_deliver_nothing() {
    let runtime = ScriptRuntime::new().unwrap();
    let result = eval(
        &runtime,
        r#"(() => {
            const exit4 = () => host.startProcessAsync("sh", '-c "exit 4"');
            return [
                host.taskWait(exit4()),
                host.taskWait(exit4(), "int"),
                host.taskWait(exit4(), "string") === undefined,
                host.taskWait(exit4(), "no-such-type") === undefined,
            ];
        })()"#,
    );
    assert_eq!(result, "[4,4,true,true]");
}

#[test]
fn task_status_and_wait() {
    let runtime = ScriptRuntime::new().unwrap();
    let result = eval(
        &runtime,
        r#"(() => {
            const op = host.taskDelay(50);
            const before = host.taskStatus(op);
            const value = host.taskWait(op);
            let consumed = false;
            try { host.taskStatus(op); } catch (e) { consumed = true; }
            return [before, value === undefined, consumed];
        })()"#,
    );
    assert_eq!(result, r#"["pending",true,true]"#);
    assert_eq!(runtime.pending_operations(), 0);
}

#[test]
fn unknown_operation_handles_fail_the_run() {
    let runtime = ScriptRuntime::new().unwrap();
    let err = runtime
        .execute("host.taskRun(() => [12345, 'int', () => {}])")
        .unwrap_err();
    assert!(matches!(err, ScriptError::Uncaught(ref message) if message.contains("unknown operation")));
    assert_eq!(runtime.live_callables(), 0);
}

#[cfg(unix)]
#[test]
fn batch_reports_every_process() {
    let runtime = ScriptRuntime::new().unwrap();
    let result = eval(
        &runtime,
        r#"(() => {
            const seen = [];
            const exits = [];
            const batch = host.createBatchProcess((id, index, code, output) => {
                seen.push([id === batch, index, code, output === undefined ? "-" : output]);
            });
            const first = host.addBatchProcess(batch, "sh", '-c "echo one"', true);
            const second = host.addBatchProcess(batch, "sh", '-c "exit 2"', false, null, (code) => exits.push(code));
            const third = host.addBatchProcess(batch, "definitely-not-a-real-binary-4242", "", true);
            const ran = host.runBatchProcess(batch, 1);
            seen.sort((a, b) => a[1] - b[1]);
            return { indices: [first, second, third], ran, seen, exits, again: host.runBatchProcess(batch) };
        })()"#,
    );
    assert_eq!(
        result,
        concat!(
            r#"{"indices":[1,2,3],"ran":true,"#,
            r#""seen":[[true,1,0,"one\n"],[true,2,2,"-"],[true,3,1,""]],"#,
            r#""exits":[2],"again":false}"#
        )
    );
    assert_eq!(runtime.live_callables(), 0);
}

#[test]
fn batch_entry_points_reject_bad_input() {
    let runtime = ScriptRuntime::new().unwrap();
    let result = eval(
        &runtime,
        r#"[
            host.createBatchProcess(42),
            host.addBatchProcess(999, "sh"),
            host.runBatchProcess(999),
        ]"#,
    );
    assert_eq!(result, "[null,false,false]");
}

#[cfg(unix)]
#[test]
fn batch_callback_failure_stops_admission() {
    let runtime = ScriptRuntime::new().unwrap();
    let result = eval(
        &runtime,
        r#"(() => {
            let calls = 0;
            const batch = host.createBatchProcess(() => { calls++; throw new Error("stop"); });
            for (let i = 0; i < 6; i++) host.addBatchProcess(batch, "sh", '-c "exit 0"');
            let error = null;
            try { host.runBatchProcess(batch, 2); } catch (e) { error = e.message; }
            return { calls, error };
        })()"#,
    );
    // Two were launched before the first failure; the other four never start.
    assert_eq!(result, r#"{"calls":2,"error":"stop"}"#);
    assert_eq!(runtime.live_callables(), 0);
}

#[test]
fn dropping_the_runtime_releases_unconsumed_work() {
    let runtime = ScriptRuntime::new().unwrap();
    runtime
        .execute("globalThis.batch = host.createBatchProcess(() => {}); host.taskDelay(5); 0")
        .unwrap();
    assert_eq!(runtime.live_callables(), 1);
    assert_eq!(runtime.pending_operations(), 1);
    drop(runtime);
}
