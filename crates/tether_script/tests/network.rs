//! TCP transports driven from JavaScript over loopback.

use tether_script::ScriptRuntime;

/// Pump both ends until `done()` is true or about two seconds pass.
const PUMP_HELPERS: &str = r#"
    globalThis.pumpUntil = (handles, done) => {
        for (let i = 0; i < 400 && !done(); i++) {
            for (const h of handles) host.tcpPumpEvents(h);
            host.taskWait(host.taskDelay(5));
        }
        return done();
    };
"#;

fn runtime() -> ScriptRuntime {
    let runtime = ScriptRuntime::new().unwrap();
    runtime.execute(PUMP_HELPERS).unwrap();
    runtime
}

fn eval(runtime: &ScriptRuntime, source: &str) -> String {
    runtime
        .eval_json(source)
        .unwrap_or_else(|err| panic!("script failed: {err}"))
        .unwrap_or_default()
}

#[test]
fn client_and_server_exchange_text_and_bytes() {
    let runtime = runtime();
    let result = eval(
        &runtime,
        r#"(() => {
            const slog = [];
            const clog = [];
            const server = host.tcpServerStart({
                endpoint: "127.0.0.1:0",
                context: "srv",
                onConnect: (ctx, endpoint) => slog.push(["s-connect", ctx, typeof endpoint]),
                onReceived: (ctx, endpoint, payload) => {
                    if (typeof payload === "string") {
                        slog.push(["s-text", payload]);
                        host.tcpServerSend(server, endpoint, host.TCP_TEXT, "pong:" + payload);
                    } else {
                        slog.push(["s-bytes", Array.from(payload)]);
                    }
                },
                onDisconnect: (ctx, endpoint) => slog.push(["s-disconnect", ctx]),
            });
            const client = host.tcpClientStart({
                endpoint: host.tcpServerEndpoint(server),
                noDelay: true,
                context: { name: "cli" },
                onConnect: (ctx) => clog.push(["c-connect", ctx.name]),
                onReceived: (ctx, payload) => clog.push(["c-text", payload]),
            });

            const sentText = host.tcpClientSend(client, host.TCP_TEXT, "ping");
            const has = (log, tag) => () => log.some((entry) => entry[0] === tag);
            pumpUntil([server, client], has(clog, "c-text"));
            host.tcpClientSend(client, host.TCP_BYTES, new Uint8Array([1, 2, 250]));
            pumpUntil([server], has(slog, "s-bytes"));

            host.tcpDispose(client);
            pumpUntil([server], has(slog, "s-disconnect"));
            const disposed = host.tcpDispose(server);
            return { sentText, disposed, slog, clog };
        })()"#,
    );
    assert_eq!(
        result,
        concat!(
            r#"{"sentText":true,"disposed":true,"slog":["#,
            r#"["s-connect","srv","string"],"#,
            r#"["s-text","ping"],"#,
            r#"["s-bytes",[1,2,250]],"#,
            r#"["s-disconnect","srv"]],"#,
            r#""clog":[["c-connect","cli"],["c-text","pong:ping"]]}"#
        )
    );
    assert_eq!(runtime.open_connections(), 0);
    assert_eq!(runtime.live_callables(), 0);
}

#[test]
fn failing_callbacks_do_not_stop_delivery() {
    let runtime = runtime();
    let result = eval(
        &runtime,
        r#"(() => {
            const received = [];
            const server = host.tcpServerStart({
                endpoint: "127.0.0.1:0",
                onReceived: (ctx, endpoint, payload) => {
                    received.push(payload);
                    if (received.length === 1) throw new Error("first one fails");
                },
            });
            const client = host.tcpClientStart({ endpoint: host.tcpServerEndpoint(server) });
            host.tcpClientSend(client, host.TCP_TEXT, "a");
            host.tcpClientSend(client, host.TCP_TEXT, "b");
            pumpUntil([server], () => received.length === 2);
            host.tcpDispose(client);
            host.tcpDispose(server);
            return received;
        })()"#,
    );
    assert_eq!(result, r#"["a","b"]"#);
}

#[test]
fn pumping_from_a_callback_delivers_nothing() {
    let runtime = runtime();
    let result = eval(
        &runtime,
        r#"(() => {
            let depth = 0, peak = 0;
            const nested = [];
            const received = [];
            const server = host.tcpServerStart({
                endpoint: "127.0.0.1:0",
                onReceived: (ctx, endpoint, payload) => {
                    depth++;
                    peak = Math.max(peak, depth);
                    received.push(payload);
                    nested.push(host.tcpPumpEvents(server));
                    depth--;
                },
            });
            const client = host.tcpClientStart({ endpoint: host.tcpServerEndpoint(server) });
            host.tcpClientSend(client, host.TCP_TEXT, "a");
            host.tcpClientSend(client, host.TCP_TEXT, "b");
            pumpUntil([server], () => received.length === 2);
            host.tcpDispose(client);
            host.tcpDispose(server);
            return { peak, received, nested };
        })()"#,
    );
    assert_eq!(result, r#"{"peak":1,"received":["a","b"],"nested":[0,0]}"#);
}

/// Answer `count` HTTP requests with `"{method}:{body}"`.
fn serve_echo(count: usize) -> String {
    use std::io::{BufRead, BufReader, Read, Write};

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for _ in 0..count {
            let (socket, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(socket);
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let method = request_line.split(' ').next().unwrap().to_string();
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();
            let reply = format!("{method}:{}", String::from_utf8_lossy(&body));
            let mut socket = reader.into_inner();
            write!(
                socket,
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{reply}",
                reply.len()
            )
            .unwrap();
        }
    });
    format!("http://{addr}/echo")
}

#[test]
fn http_requests_return_text_or_bytes() {
    let runtime = runtime();
    let url = serde_json::to_string(&serve_echo(2)).unwrap();
    let result = eval(
        &runtime,
        &format!(
            r#"(() => {{
                const text = host.httpRequest({url}, "POST", "hi", {{ "X-Trace": "1" }});
                const bytes = host.httpRequest({url}, "GET", null, null, true);
                let failed = false;
                try {{ host.httpRequest("http://127.0.0.1:1/", "GET"); }} catch (e) {{ failed = true; }}
                return [text, Array.from(bytes), failed];
            }})()"#
        ),
    );
    assert_eq!(result, r#"["POST:hi",[71,69,84,58],true]"#);
}

#[test]
fn start_failures_return_null() {
    let runtime = runtime();
    let result = eval(
        &runtime,
        r#"(() => {
            const server = host.tcpServerStart({ endpoint: "127.0.0.1:0" });
            const taken = host.tcpServerStart({ endpoint: host.tcpServerEndpoint(server) });
            const invalid = host.tcpClientStart({ endpoint: "not an endpoint" });
            host.tcpDispose(server);
            return [taken, invalid];
        })()"#,
    );
    assert_eq!(result, "[null,null]");
    assert_eq!(runtime.live_callables(), 0);
}

#[test]
fn sends_validate_handles_and_tags() {
    let runtime = runtime();
    let result = eval(
        &runtime,
        r#"(() => {
            const server = host.tcpServerStart({ endpoint: "127.0.0.1:0" });
            let badTag = null;
            try { host.tcpServerSend(server, "127.0.0.1:9", 7, "x"); } catch (e) { badTag = e.message; }
            const result = {
                unknownHandle: host.tcpClientSend(999, host.TCP_TEXT, "x"),
                unknownPeer: host.tcpServerSend(server, "127.0.0.1:9", host.TCP_TEXT, "x"),
                wrongKind: host.tcpClientSend(server, host.TCP_TEXT, "x"),
                badTag,
                clientEndpoint: host.tcpServerEndpoint(999),
            };
            host.tcpDispose(server);
            result.disposedTwice = host.tcpDispose(server);
            return result;
        })()"#,
    );
    assert_eq!(
        result,
        concat!(
            r#"{"unknownHandle":false,"unknownPeer":false,"wrongKind":false,"#,
            r#""badTag":"unknown payload tag 7","clientEndpoint":null,"disposedTwice":false}"#
        )
    );
}

#[test]
fn undisposed_connections_are_closed_with_the_runtime() {
    let runtime = runtime();
    runtime
        .execute(r#"globalThis.server = host.tcpServerStart({ endpoint: "127.0.0.1:0", onConnect: () => {} }); 0"#)
        .unwrap();
    assert_eq!(runtime.open_connections(), 1);
    assert_eq!(runtime.live_callables(), 1);
    drop(runtime);
}

#[test]
fn failed_downloads_fail_their_operation() {
    let runtime = runtime();
    let dir = tempfile::tempdir().unwrap();
    let target = serde_json::to_string(&dir.path().join("out.bin")).unwrap();
    let result = eval(
        &runtime,
        &format!(
            r#"(() => {{
                const op = host.httpDownload("http://127.0.0.1:1/missing", {target});
                try {{ host.taskWait(op); return "completed"; }} catch (e) {{ return "failed"; }}
            }})()"#
        ),
    );
    assert_eq!(result, r#""failed""#);
}
