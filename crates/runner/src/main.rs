//! Standalone proxy daemon: loads the TOML config, opens one listener per
//! configured port, and serves a line-oriented control port for inspecting
//! and steering the live session (feature toggles, overrides, roster,
//! frame injection).

use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use shipgate_proxy::config::{ConfigLoader, ProxyConfig};
use shipgate_proxy::frame::Frame;
use shipgate_proxy::proxy::ProxyServer;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "shipgate.toml".to_string());
    let config: ProxyConfig = ConfigLoader::parse_from_file(&config_path)
        .with_context(|| format!("load {config_path}"))?;

    let services = config.build_services()?;
    let proxy = ProxyServer::new(services);

    if config.listeners.is_empty() {
        anyhow::bail!("no listeners configured");
    }
    for listener in &config.listeners {
        proxy
            .listen(listener.port, listener.version, listener.destination)
            .await?;
    }

    let control = TcpListener::bind(&config.control_listen)
        .await
        .with_context(|| format!("bind control listener {}", config.control_listen))?;
    info!("runner.started control={}", config.control_listen);

    loop {
        let (socket, peer) = control.accept().await?;
        info!("runner.control.accepted peer={peer}");
        let proxy = proxy.clone();
        tokio::spawn(async move {
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let reply = match run_control_line(&proxy, line).await {
                    Ok(reply) => reply,
                    Err(e) => format!("error: {e:#}"),
                };
                if write
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }
}

async fn run_control_line(proxy: &Arc<ProxyServer>, line: &str) -> anyhow::Result<String> {
    let command = parse_control_line(line)?;
    match command {
        ControlCommand::Sessions => {
            let ids = proxy.session_ids().await;
            Ok(format!(
                "sessions {}",
                ids.iter()
                    .map(|id| format!("{id:016X}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            ))
        }
        ControlCommand::Flags => {
            let session = proxy.get_session().await?;
            let st = session.state.lock().await;
            let t = &st.toggles;
            Ok(format!(
                "suppress-commands={} chat-filter={} switch-assist={} infinite-hp={} infinite-tp={} save-files={} function-call-return={} lobby-event={} lobby-number={} section-id={}",
                t.suppress_shell_commands,
                t.enable_chat_filter,
                t.enable_switch_assist,
                t.infinite_hp,
                t.infinite_tp,
                t.save_files,
                t.function_call_return_value,
                t.override_lobby_event,
                t.override_lobby_number,
                t.override_section_id,
            ))
        }
        ControlCommand::Roster => {
            let session = proxy.get_session().await?;
            let st = session.state.lock().await;
            let mut out = String::new();
            for (slot, player) in st.lobby_players.iter().enumerate() {
                if player.guild_card_number == 0 {
                    continue;
                }
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(&format!("{slot}:{}:{}", player.guild_card_number, player.name));
            }
            if out.is_empty() {
                out.push_str("(empty)");
            }
            Ok(out)
        }
        ControlCommand::SetFlag { flag, enabled } => {
            let session = proxy.get_session().await?;
            let mut st = session.state.lock().await;
            let t = &mut st.toggles;
            match flag {
                Flag::SuppressCommands => t.suppress_shell_commands = enabled,
                Flag::ChatFilter => t.enable_chat_filter = enabled,
                Flag::SwitchAssist => t.enable_switch_assist = enabled,
                Flag::InfiniteHp => t.infinite_hp = enabled,
                Flag::InfiniteTp => t.infinite_tp = enabled,
                Flag::SaveFiles => t.save_files = enabled,
            }
            Ok("ok".to_string())
        }
        ControlCommand::SetValue { value, amount } => {
            let session = proxy.get_session().await?;
            let mut st = session.state.lock().await;
            let t = &mut st.toggles;
            match value {
                Value::FunctionCallReturn => t.function_call_return_value = amount,
                Value::LobbyEvent => t.override_lobby_event = amount as i32,
                Value::LobbyNumber => t.override_lobby_number = amount as i32,
                Value::SectionId => t.override_section_id = amount as i32,
            }
            Ok("ok".to_string())
        }
        ControlCommand::Send {
            to_server,
            opcode,
            payload,
        } => {
            let session = proxy.get_session().await?;
            warn!(
                "runner.control.inject to_server={to_server} opcode={opcode:02X} len={}",
                payload.len()
            );
            session
                .send_to_end(to_server, Frame::new(opcode, 0, payload))
                .await;
            Ok("ok".to_string())
        }
    }
}

#[derive(Debug, PartialEq)]
enum Flag {
    SuppressCommands,
    ChatFilter,
    SwitchAssist,
    InfiniteHp,
    InfiniteTp,
    SaveFiles,
}

#[derive(Debug, PartialEq)]
enum Value {
    FunctionCallReturn,
    LobbyEvent,
    LobbyNumber,
    SectionId,
}

#[derive(Debug, PartialEq)]
enum ControlCommand {
    Sessions,
    Flags,
    Roster,
    SetFlag { flag: Flag, enabled: bool },
    SetValue { value: Value, amount: i64 },
    Send { to_server: bool, opcode: u16, payload: Vec<u8> },
}

fn parse_control_line(line: &str) -> anyhow::Result<ControlCommand> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().context("empty command")?;
    match verb {
        "sessions" => Ok(ControlCommand::Sessions),
        "flags" => Ok(ControlCommand::Flags),
        "roster" => Ok(ControlCommand::Roster),
        "set" => {
            let name = parts.next().context("set: missing flag name")?;
            let state = parts.next().context("set: missing value")?;
            if let Some(flag) = flag_by_name(name) {
                let enabled = match state {
                    "on" => true,
                    "off" => false,
                    other => anyhow::bail!("set: expected on/off, got {other}"),
                };
                return Ok(ControlCommand::SetFlag { flag, enabled });
            }
            let value =
                value_by_name(name).ok_or_else(|| anyhow::anyhow!("set: unknown setting {name}"))?;
            let amount = if state == "off" {
                -1
            } else {
                state
                    .parse()
                    .with_context(|| format!("set: expected a number or off, got {state}"))?
            };
            Ok(ControlCommand::SetValue { value, amount })
        }
        "send" => {
            let target = parts.next().context("send: missing target")?;
            let to_server = match target {
                "server" => true,
                "client" => false,
                other => anyhow::bail!("send: expected client/server, got {other}"),
            };
            let opcode_hex = parts.next().context("send: missing opcode")?;
            let opcode = u16::from_str_radix(opcode_hex.trim_start_matches("0x"), 16)
                .with_context(|| format!("send: invalid opcode {opcode_hex}"))?;
            let payload = match parts.next() {
                Some(hex) => decode_hex(hex)?,
                None => Vec::new(),
            };
            Ok(ControlCommand::Send {
                to_server,
                opcode,
                payload,
            })
        }
        other => anyhow::bail!("unknown command {other}"),
    }
}

fn flag_by_name(name: &str) -> Option<Flag> {
    match name {
        "suppress-commands" => Some(Flag::SuppressCommands),
        "chat-filter" => Some(Flag::ChatFilter),
        "switch-assist" => Some(Flag::SwitchAssist),
        "infinite-hp" => Some(Flag::InfiniteHp),
        "infinite-tp" => Some(Flag::InfiniteTp),
        "save-files" => Some(Flag::SaveFiles),
        _ => None,
    }
}

fn value_by_name(name: &str) -> Option<Value> {
    match name {
        "function-call-return" => Some(Value::FunctionCallReturn),
        "lobby-event" => Some(Value::LobbyEvent),
        "lobby-number" => Some(Value::LobbyNumber),
        "section-id" => Some(Value::SectionId),
        _ => None,
    }
}

fn decode_hex(input: &str) -> anyhow::Result<Vec<u8>> {
    let clean = input.trim();
    if clean.len() % 2 != 0 {
        anyhow::bail!("hex length must be even");
    }
    let mut out = Vec::with_capacity(clean.len() / 2);
    let bytes = clean.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let hi = hex_nibble(bytes[i])?;
        let lo = hex_nibble(bytes[i + 1])?;
        out.push((hi << 4) | lo);
        i += 2;
    }
    Ok(out)
}

fn hex_nibble(ch: u8) -> anyhow::Result<u8> {
    match ch {
        b'0'..=b'9' => Ok(ch - b'0'),
        b'a'..=b'f' => Ok(ch - b'a' + 10),
        b'A'..=b'F' => Ok(ch - b'A' + 10),
        _ => anyhow::bail!("invalid hex character {}", ch as char),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flag_commands() {
        assert_eq!(
            parse_control_line("set infinite-hp on").unwrap(),
            ControlCommand::SetFlag {
                flag: Flag::InfiniteHp,
                enabled: true
            }
        );
        assert_eq!(
            parse_control_line("set chat-filter off").unwrap(),
            ControlCommand::SetFlag {
                flag: Flag::ChatFilter,
                enabled: false
            }
        );
        assert!(parse_control_line("set infinite-hp yes").is_err());
    }

    #[test]
    fn parses_value_commands() {
        assert_eq!(
            parse_control_line("set function-call-return 305419896").unwrap(),
            ControlCommand::SetValue {
                value: Value::FunctionCallReturn,
                amount: 305419896
            }
        );
        assert_eq!(
            parse_control_line("set lobby-event off").unwrap(),
            ControlCommand::SetValue {
                value: Value::LobbyEvent,
                amount: -1
            }
        );
    }

    #[test]
    fn parses_send_commands() {
        assert_eq!(
            parse_control_line("send client 11 0000000000000000").unwrap(),
            ControlCommand::Send {
                to_server: false,
                opcode: 0x11,
                payload: vec![0; 8]
            }
        );
        // Odd-length hex payload is rejected.
        assert!(parse_control_line("send server 0x60 9a020").is_err());
    }

    #[test]
    fn rejects_unknown_commands() {
        assert!(parse_control_line("dance").is_err());
        assert!(parse_control_line("set nonsense on").is_err());
    }
}
