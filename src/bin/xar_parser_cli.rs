//! Validate a XAR header and print it as a single line of JSON.

use xar_parser::{parse_xar_header, serialize_header_as_json};

fn help(prog: &str) {
    println!(
        "usage: {} [OPTIONS] PATH_TO_XAR\n\n\
         Validate the XAR header and the squashfs magic at its offset, then\n\
         print the parsed header as JSON. Output is a single line with no\n\
         unnecessary whitespace. Keys are the parameter names as they appear\n\
         in the XAR header; values are serialized according to their type\n\
         (strings are wrapped in double quotes, integers are not).\n\n\
         Options:\n\
             -h, --help  Display this message\n",
        prog
    );
}

fn usage(prog: &str) {
    eprintln!("invalid usage\n(use {} --help to get help)", prog);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let prog = args
        .get(0)
        .map(String::as_str)
        .unwrap_or("xar_parser_cli");

    if args.len() > 1 && (args[1] == "--help" || args[1] == "-h") {
        help(prog);
        std::process::exit(0);
    }
    if args.len() != 2 {
        usage(prog);
        std::process::exit(1);
    }

    match parse_xar_header(&args[1]) {
        Ok(header) => println!("{}", serialize_header_as_json(&header)),
        Err(err) => {
            eprintln!("Error parsing XAR header: {}", err);
            std::process::exit(1);
        }
    }
}
