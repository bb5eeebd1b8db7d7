#![no_main]

use harmoniq_cli::fuzz_parse_scenario;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    fuzz_parse_scenario(data);
});
