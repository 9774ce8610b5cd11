use genisys::config::MasterConfig;

fn main() {
    let config = serdeconv::to_toml_string(&MasterConfig::default())
        .expect("Failed to generate config file");

    println!("{}", config);
}
