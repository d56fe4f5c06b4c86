//! Embedded admin page
//!
//! A single self-contained HTML page served by the post-proxy for
//! anything that is not a tagged proxy request or a management API call.
//! It lists environments, starts/stops them and reassigns dev servers
//! through the management REST surface, and listens on the notification
//! socket to refresh itself after config reloads.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};

/// Serve the admin page HTML
pub fn serve_admin_page(base_path: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let html = ADMIN_HTML.replace("__BASE_PATH__", base_path);
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(html)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

const ADMIN_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>envgate</title>
    <style>
        body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 64rem; color: #222; }
        h1 { font-size: 1.4rem; }
        table { border-collapse: collapse; width: 100%; margin-top: 1rem; }
        th, td { text-align: left; padding: 0.5rem 0.75rem; border-bottom: 1px solid #ddd; }
        .status-running { color: #1a7f37; font-weight: 600; }
        .status-stopped { color: #888; }
        button { padding: 0.25rem 0.75rem; cursor: pointer; }
        select { padding: 0.2rem; }
        #note { color: #666; font-size: 0.85rem; margin-top: 1rem; }
    </style>
</head>
<body>
    <h1>envgate environments</h1>
    <table>
        <thead>
            <tr><th>Name</th><th>Port</th><th>API origin</th><th>Dev server</th><th>Status</th><th></th></tr>
        </thead>
        <tbody id="envs"></tbody>
    </table>
    <p id="note"></p>
    <script>
        const BASE = '__BASE_PATH__';
        let devServers = [];

        async function api(path, options) {
            const res = await fetch(BASE + path, options);
            const body = await res.json();
            if (body.code !== 200) {
                document.getElementById('note').textContent = body.message;
                throw new Error(body.message);
            }
            return body.data;
        }

        function devServerSelect(env) {
            const options = devServers.map(d =>
                `<option value="${d.name}" ${d.name === env.dev_server ? 'selected' : ''}>${d.name}</option>`
            ).join('');
            return `<select onchange="switchDevServer('${env.name}', ${env.port}, this.value)">${options}</select>`;
        }

        async function refresh() {
            devServers = (await api('/get-dev-server-list')).list;
            const envs = (await api('/getlist')).list;
            document.getElementById('envs').innerHTML = envs.map(env => `
                <tr>
                    <td><a href="http://${location.hostname}:${env.port}${env.index_page}">${env.name}</a></td>
                    <td>${env.port}</td>
                    <td>${env.api_base_url}</td>
                    <td>${devServerSelect(env)}</td>
                    <td class="status-${env.status}">${env.status}</td>
                    <td><button onclick="manage('${env.status === 'running' ? 'stop' : 'start'}', '${env.name}', ${env.port})">
                        ${env.status === 'running' ? 'Stop' : 'Start'}</button></td>
                </tr>`).join('');
        }

        async function manage(action, name, port) {
            await api('/manage-server', {
                method: 'POST',
                headers: { 'Content-Type': 'application/json' },
                body: JSON.stringify({ action, name, port }),
            });
            refresh();
        }

        async function switchDevServer(name, port, dev_server) {
            await api('/update-dev-server-id', {
                method: 'POST',
                headers: { 'Content-Type': 'application/json' },
                body: JSON.stringify({ name, port, dev_server }),
            });
            refresh();
        }

        function watchReloads() {
            const ws = new WebSocket(`ws://${location.host}${BASE}`);
            ws.onmessage = () => refresh();
            ws.onclose = () => setTimeout(watchReloads, 2000);
        }

        refresh();
        watchReloads();
    </script>
</body>
</html>
"##;
