//! Operator hints: print the command line for the other side of the tunnel
//! so it can be started by copy-paste. For plain (non-mux) tunnels this
//! includes the curl/nc and openssl pipelines that interoperate without this
//! program installed.

use pt_crypto::CipherSuite;
use pt_relay::Url;

use crate::TunnelEnv;
use crate::cli::TunnelFlags;

/// Printed by the client host: how to start the matching server host.
pub fn print_for_server_host(
    env: &TunnelEnv,
    flags: &TunnelFlags,
    cs_url: &Url,
    sc_url: &Url,
    cs_path: &str,
    sc_path: &str,
) {
    if !flags.yamux && !flags.pmux {
        match openssl_hint(flags) {
            Some((bits, iter, hash)) => {
                println!("hint: server host (nc + curl + openssl), <PORT> should be replaced");
                println!(
                    "  read -p \"passphrase: \" -s pass && curl -sSN {cs_url} | stdbuf -i0 -o0 openssl aes-{bits}-ctr -d -pass \"pass:$pass\" -bufsize 1 -pbkdf2 -iter {iter} -md {hash} | nc 127.0.0.1 <PORT> | stdbuf -i0 -o0 openssl aes-{bits}-ctr -pass \"pass:$pass\" -bufsize 1 -pbkdf2 -iter {iter} -md {hash} | curl -sSNT - {sc_url}; unset pass"
                );
            }
            None if !flags.symmetric => {
                println!("hint: server host (nc + curl), <PORT> should be replaced");
                println!("  curl -sSN {cs_url} | nc 127.0.0.1 <PORT> | curl -sSNT - {sc_url}");
            }
            None => {}
        }
    }
    println!("hint: server host (piping-tunnel)");
    println!(
        "  piping-tunnel -s {} server -p <PORT> {}{} {}",
        env.server_url,
        shared_flags(flags),
        cs_path,
        sc_path
    );
    println!("    OR");
    println!(
        "  piping-tunnel -s {} socks {}{} {}",
        env.server_url,
        shared_flags(flags),
        cs_path,
        sc_path
    );
}

/// Printed by the server and socks hosts: how to start the matching client
/// host.
pub fn print_for_client_host(
    env: &TunnelEnv,
    flags: &TunnelFlags,
    cs_url: &Url,
    sc_url: &Url,
    cs_path: &str,
    sc_path: &str,
) {
    if !flags.yamux && !flags.pmux {
        match openssl_hint(flags) {
            Some((bits, iter, hash)) => {
                println!("hint: client host (socat + curl + openssl)");
                println!(
                    "  read -p \"passphrase: \" -s pass && curl -NsS {sc_url} | stdbuf -i0 -o0 openssl aes-{bits}-ctr -d -pass \"pass:$pass\" -bufsize 1 -pbkdf2 -iter {iter} -md {hash} | socat TCP-LISTEN:31376 - | stdbuf -i0 -o0 openssl aes-{bits}-ctr -pass \"pass:$pass\" -bufsize 1 -pbkdf2 -iter {iter} -md {hash} | curl -NsST - {cs_url}; unset pass"
                );
            }
            None if !flags.symmetric => {
                println!("hint: client host (socat + curl)");
                println!("  curl -NsS {sc_url} | socat TCP-LISTEN:31376 - | curl -NsST - {cs_url}");
            }
            None => {}
        }
    }
    println!("hint: client host (piping-tunnel)");
    println!(
        "  piping-tunnel -s {} client -p 31376 {}{} {}",
        env.server_url,
        shared_flags(flags),
        cs_path,
        sc_path
    );
}

/// `(key_bits, iter, hash)` when the configured cipher has an openssl CLI
/// equivalent.
fn openssl_hint(flags: &TunnelFlags) -> Option<(u32, u32, &'static str)> {
    if !flags.symmetric {
        return None;
    }
    let suite = CipherSuite::parse(&flags.cipher_type, flags.pbkdf2.as_deref()).ok()?;
    match suite {
        CipherSuite::OpensslAes128Ctr { pbkdf2 } => {
            Some((128, pbkdf2.iter, pbkdf2.hash.openssl_name()))
        }
        CipherSuite::OpensslAes256Ctr { pbkdf2 } => {
            Some((256, pbkdf2.iter, pbkdf2.hash.openssl_name()))
        }
        _ => None,
    }
}

/// The flags both sides must agree on, rendered for the peer's command line.
fn shared_flags(flags: &TunnelFlags) -> String {
    let mut out = String::new();
    if flags.symmetric {
        out.push_str("-c ");
        out.push_str(&format!("--cipher-type={} ", flags.cipher_type));
        if let Some(pbkdf2) = &flags.pbkdf2 {
            out.push_str(&format!("--pbkdf2='{pbkdf2}' "));
        }
    }
    if flags.yamux {
        out.push_str("--yamux ");
    }
    if flags.pmux {
        out.push_str("--pmux ");
    }
    out
}
